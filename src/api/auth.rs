use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::AppState;
use crate::errors::AppError;

/// The signed-in user, inserted as a request extension by [`require_user`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// Verifier for HS256 tokens issued by the external identity provider.
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str, audience: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        match audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthUser, AppError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            tracing::debug!("rejected bearer token: {}", e);
            AppError::Unauthorized
        })?;
        let user_id = Uuid::parse_str(&data.claims.sub).map_err(|_| {
            tracing::debug!("bearer token subject is not a user id");
            AppError::Unauthorized
        })?;
        Ok(AuthUser { user_id })
    }
}

/// Middleware: requires `Authorization: Bearer <jwt>` and attaches [`AuthUser`].
pub async fn require_user(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim())
        .ok_or_else(|| {
            tracing::warn!("api: missing bearer token");
            AppError::Unauthorized
        })?;

    let user = state.verifier.verify(token)?;
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims<'a> {
        sub: &'a str,
        exp: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        aud: Option<&'a str>,
    }

    fn token(secret: &str, sub: &str, aud: Option<&str>) -> String {
        let claims = TestClaims {
            sub,
            exp: (chrono::Utc::now().timestamp() + 600) as usize,
            aud,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn test_valid_token_yields_user() {
        let user = Uuid::new_v4();
        let verifier = TokenVerifier::new("secret", None);
        let auth = verifier.verify(&token("secret", &user.to_string(), None)).unwrap();
        assert_eq!(auth.user_id, user);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let verifier = TokenVerifier::new("secret", None);
        let t = token("other", &Uuid::new_v4().to_string(), None);
        assert!(matches!(verifier.verify(&t), Err(AppError::Unauthorized)));
    }

    #[test]
    fn test_non_uuid_subject_rejected() {
        let verifier = TokenVerifier::new("secret", None);
        assert!(verifier.verify(&token("secret", "alice", None)).is_err());
    }

    #[test]
    fn test_audience_enforced_when_configured() {
        let verifier = TokenVerifier::new("secret", Some("promptcraft"));
        let sub = Uuid::new_v4().to_string();
        assert!(verifier.verify(&token("secret", &sub, Some("promptcraft"))).is_ok());
        assert!(verifier.verify(&token("secret", &sub, Some("someone-else"))).is_err());
    }
}
