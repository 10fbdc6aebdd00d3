//! Built-in prompt frameworks and body rendering.
//!
//! A body template is plain text with three placeholders: `{{task}}`,
//! `{{tone}}` and `{{length}}`. Lines carrying `{{tone}}` or `{{length}}`
//! form the optional style sections. In vibe mode those lines are dropped
//! entirely; otherwise a missing value falls back to a neutral phrase.
//! Substituted values are never scanned for placeholders again.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;

use crate::models::generation::GenerationRequest;

pub const TASK_PLACEHOLDER: &str = "{{task}}";
pub const TONE_PLACEHOLDER: &str = "{{tone}}";
pub const LENGTH_PLACEHOLDER: &str = "{{length}}";

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{(\w+)\}\}").unwrap());

/// Used when vibe mode is off but no tone was given.
pub const NEUTRAL_TONE: &str = "clear, neutral and professional";
/// Used when vibe mode is off but no length was given.
pub const NEUTRAL_LENGTH: &str = "as long as the task requires, without padding";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameworkTemplate {
    pub id: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    pub component_names: &'static [&'static str],
    #[serde(skip)]
    pub body_template: &'static str,
}

pub static BUILTIN_FRAMEWORKS: [FrameworkTemplate; 9] = [
    FrameworkTemplate {
        id: "ape",
        display_name: "APE",
        description: "Action, Purpose, Expectation: a compact frame for single, well-scoped requests.",
        component_names: &["Action", "Purpose", "Expectation"],
        body_template: "You are an expert prompt engineer. Write a complete, ready-to-use prompt using the APE framework.

Task description: {{task}}
Tone of the generated prompt: {{tone}}
Length of the generated prompt: {{length}}

Structure the prompt with these labeled sections:
ACTION: the concrete action the assistant must perform.
PURPOSE: why the action matters and what it serves.
EXPECTATION: the exact outcome and format expected.

Return only the finished prompt.",
    },
    FrameworkTemplate {
        id: "race",
        display_name: "RACE",
        description: "Role, Action, Context, Expectation: frames the assistant as a specialist with background.",
        component_names: &["Role", "Action", "Context", "Expectation"],
        body_template: "You are an expert prompt engineer. Write a complete, ready-to-use prompt using the RACE framework.

Task description: {{task}}
Tone of the generated prompt: {{tone}}
Length of the generated prompt: {{length}}

Structure the prompt with these labeled sections:
ROLE: the expert persona the assistant should adopt.
ACTION: what the assistant must do.
CONTEXT: the background and constraints that shape the work.
EXPECTATION: the result and format expected.

Return only the finished prompt.",
    },
    FrameworkTemplate {
        id: "coast",
        display_name: "COAST",
        description: "Context, Objective, Actions, Scenario, Task: for multi-step work with a clear setting.",
        component_names: &["Context", "Objective", "Actions", "Scenario", "Task"],
        body_template: "You are an expert prompt engineer. Write a complete, ready-to-use prompt using the COAST framework.

Task description: {{task}}
Tone of the generated prompt: {{tone}}
Length of the generated prompt: {{length}}

Structure the prompt with these labeled sections:
CONTEXT: the situation and relevant background.
OBJECTIVE: the goal to reach.
ACTIONS: the steps needed to reach it.
SCENARIO: the circumstances or audience the output is for.
TASK: the specific deliverable.

Return only the finished prompt.",
    },
    FrameworkTemplate {
        id: "tag",
        display_name: "TAG",
        description: "Task, Action, Goal: ties a task to measurable outcomes.",
        component_names: &["Task", "Action", "Goal"],
        body_template: "You are an expert prompt engineer. Write a complete, ready-to-use prompt using the TAG framework.

Task description: {{task}}
Tone of the generated prompt: {{tone}}
Length of the generated prompt: {{length}}

Structure the prompt with these labeled sections:
TASK: define the task to be performed.
ACTION: describe the concrete actions required.
GOAL: state the goal and how success is measured.

Return only the finished prompt.",
    },
    FrameworkTemplate {
        id: "rise",
        display_name: "RISE",
        description: "Role, Input, Steps, Expectation: walks the assistant through a defined process.",
        component_names: &["Role", "Input", "Steps", "Expectation"],
        body_template: "You are an expert prompt engineer. Write a complete, ready-to-use prompt using the RISE framework.

Task description: {{task}}
Tone of the generated prompt: {{tone}}
Length of the generated prompt: {{length}}

Structure the prompt with these labeled sections:
ROLE: the persona the assistant should adopt.
INPUT: the information the assistant is given.
STEPS: the ordered steps to follow.
EXPECTATION: the expected output.

Return only the finished prompt.",
    },
    FrameworkTemplate {
        id: "trace",
        display_name: "TRACE",
        description: "Task, Request, Action, Context, Example: adds a worked example to anchor the output.",
        component_names: &["Task", "Request", "Action", "Context", "Example"],
        body_template: "You are an expert prompt engineer. Write a complete, ready-to-use prompt using the TRACE framework.

Task description: {{task}}
Tone of the generated prompt: {{tone}}
Length of the generated prompt: {{length}}

Structure the prompt with these labeled sections:
TASK: the overall task.
REQUEST: the specific request being made.
ACTION: the actions the assistant must take.
CONTEXT: background that shapes the answer.
EXAMPLE: a short example of the desired output.

Return only the finished prompt.",
    },
    FrameworkTemplate {
        id: "era",
        display_name: "ERA",
        description: "Expectation, Role, Action: leads with the desired result.",
        component_names: &["Expectation", "Role", "Action"],
        body_template: "You are an expert prompt engineer. Write a complete, ready-to-use prompt using the ERA framework.

Task description: {{task}}
Tone of the generated prompt: {{tone}}
Length of the generated prompt: {{length}}

Structure the prompt with these labeled sections:
EXPECTATION: the result the assistant must deliver.
ROLE: the persona the assistant should adopt.
ACTION: what the assistant must do.

Return only the finished prompt.",
    },
    FrameworkTemplate {
        id: "care",
        display_name: "CARE",
        description: "Context, Action, Result, Example: grounds the request in a concrete outcome.",
        component_names: &["Context", "Action", "Result", "Example"],
        body_template: "You are an expert prompt engineer. Write a complete, ready-to-use prompt using the CARE framework.

Task description: {{task}}
Tone of the generated prompt: {{tone}}
Length of the generated prompt: {{length}}

Structure the prompt with these labeled sections:
CONTEXT: the situation and background.
ACTION: what the assistant must do.
RESULT: the outcome that counts as success.
EXAMPLE: an example of a good result.

Return only the finished prompt.",
    },
    FrameworkTemplate {
        id: "roses",
        display_name: "ROSES",
        description: "Role, Objective, Scenario, Expected Solution, Steps: for problem solving with a defined solution shape.",
        component_names: &["Role", "Objective", "Scenario", "Expected Solution", "Steps"],
        body_template: "You are an expert prompt engineer. Write a complete, ready-to-use prompt using the ROSES framework.

Task description: {{task}}
Tone of the generated prompt: {{tone}}
Length of the generated prompt: {{length}}

Structure the prompt with these labeled sections:
ROLE: the persona the assistant should adopt.
OBJECTIVE: the objective to achieve.
SCENARIO: the situation the problem sits in.
EXPECTED SOLUTION: what a good solution looks like.
STEPS: the steps to reach that solution.

Return only the finished prompt.",
    },
];

/// Read-only lookup over the built-in frameworks, built once at startup.
pub struct FrameworkRegistry {
    by_id: HashMap<&'static str, &'static FrameworkTemplate>,
}

impl FrameworkRegistry {
    pub fn builtin() -> Self {
        let by_id: HashMap<_, _> = BUILTIN_FRAMEWORKS.iter().map(|f| (f.id, f)).collect();
        debug_assert_eq!(by_id.len(), BUILTIN_FRAMEWORKS.len(), "framework ids must be unique");
        Self { by_id }
    }

    pub fn get(&self, id: &str) -> Option<&'static FrameworkTemplate> {
        self.by_id.get(id).copied()
    }

    /// All frameworks in display order.
    pub fn list(&self) -> &'static [FrameworkTemplate] {
        &BUILTIN_FRAMEWORKS
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for FrameworkRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl FrameworkTemplate {
    /// Render the body for a request.
    ///
    /// Every placeholder is filled in one pass over the template text, so
    /// placeholder-like text inside the task, tone or length is left alone.
    pub fn render(&self, request: &GenerationRequest) -> String {
        let tone = request.tone().unwrap_or(NEUTRAL_TONE);
        let length = request.length().unwrap_or(NEUTRAL_LENGTH);
        let task = request.task_description.trim();

        self.body_template
            .lines()
            .filter(|line| {
                !(request.vibe_coding
                    && (line.contains(TONE_PLACEHOLDER) || line.contains(LENGTH_PLACEHOLDER)))
            })
            .map(|line| {
                PLACEHOLDER_RE
                    .replace_all(line, |caps: &Captures| match &caps[1] {
                        "task" => task.to_string(),
                        "tone" => tone.to_string(),
                        "length" => length.to_string(),
                        _ => caps[0].to_string(),
                    })
                    .into_owned()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
