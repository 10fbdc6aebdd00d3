use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

use forge::models::generation::GenerationRequest;
use forge::models::provider::Provider;

/// PromptCraft Forge: encrypted provider keys and framework-based prompt generation
#[derive(Parser)]
#[command(name = "promptcraft", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API
    Serve {
        /// Port to bind (defaults to FORGE_PORT, then 8080)
        #[arg(short, long)]
        port: Option<u16>,
        /// Keep keys and history in memory instead of Postgres
        #[arg(long)]
        ephemeral: bool,
    },

    /// Manage a user's stored provider keys
    Credential {
        /// Owning user id
        #[arg(long, env = "FORGE_USER_ID")]
        user: Uuid,
        #[command(subcommand)]
        command: CredentialCommands,
    },

    /// List the built-in prompt frameworks
    Frameworks,

    /// Render a framework locally without calling any provider
    Render {
        #[command(flatten)]
        request: RequestArgs,
    },

    /// Generate a prompt with the user's active provider
    Generate {
        /// Owning user id
        #[arg(long, env = "FORGE_USER_ID")]
        user: Uuid,
        #[command(flatten)]
        request: RequestArgs,
    },
}

#[derive(Subcommand)]
pub enum CredentialCommands {
    /// Store (or replace) the key for a provider
    Set {
        /// openai, gemini or anthropic
        provider: Provider,
        /// The raw API key. Prefer the env var to keep it out of shell history.
        #[arg(long, env = "FORGE_API_KEY", hide_env_values = true)]
        key: String,
    },
    /// Show masked key hints, active flag and last validation per provider
    GetStatus,
    /// Remove the key for a provider (no error if absent)
    Delete { provider: Provider },
    /// List providers with a stored key
    List,
    /// Make a provider the one used for generation
    Activate { provider: Provider },
    /// Check the stored key against the provider's API
    Validate { provider: Provider },
}

#[derive(Args)]
pub struct RequestArgs {
    /// Framework id, e.g. tag, ape, roses
    #[arg(long)]
    pub framework: String,
    #[arg(long)]
    pub task: String,
    #[arg(long)]
    pub tone: Option<String>,
    #[arg(long)]
    pub length: Option<String>,
    /// Let the model choose tone and length
    #[arg(long)]
    pub vibe: bool,
}

impl RequestArgs {
    pub fn into_request(self) -> GenerationRequest {
        GenerationRequest {
            framework_id: self.framework,
            task_description: self.task,
            tone: self.tone,
            length: self.length,
            vibe_coding: self.vibe,
        }
    }
}
