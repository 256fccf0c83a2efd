//! Identity collaborator: turns the WebSocket upgrade query into the
//! `(user id, role)` pair the relay trusts for the lifetime of a connection.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ParticipantRole;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub role: ParticipantRole,
}

/// Query parameters accepted on `GET /ws`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityQuery {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity token required")]
    MissingToken,
    #[error("user id and role required")]
    MissingIdentity,
    #[error("invalid role: {0}")]
    InvalidRole(String),
    #[error("token validation failed: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

impl IdentityError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            IdentityError::MissingToken => "missing_token",
            IdentityError::MissingIdentity => "missing_identity",
            IdentityError::InvalidRole(_) => "invalid_role",
            IdentityError::InvalidToken(_) => "invalid_token",
        }
    }
}

#[derive(Debug, Deserialize)]
struct IdentityClaims {
    sub: String,
    role: String,
}

/// Resolves identities either from HS256 tokens minted by the account
/// service, or, without a secret, from plain query parameters.
#[derive(Clone)]
pub enum IdentityVerifier {
    Jwt {
        key: DecodingKey,
        validation: Validation,
    },
    Trusted,
}

impl IdentityVerifier {
    pub fn from_secret(secret: Option<&str>) -> Self {
        match secret {
            Some(secret) => {
                let mut validation = Validation::new(Algorithm::HS256);
                validation.set_required_spec_claims(&["exp", "sub"]);
                IdentityVerifier::Jwt {
                    key: DecodingKey::from_secret(secret.as_bytes()),
                    validation,
                }
            }
            None => IdentityVerifier::Trusted,
        }
    }

    pub fn is_trusted(&self) -> bool {
        matches!(self, IdentityVerifier::Trusted)
    }

    pub fn resolve(&self, query: &IdentityQuery) -> Result<Identity, IdentityError> {
        match self {
            IdentityVerifier::Jwt { key, validation } => {
                let token = query
                    .token
                    .as_deref()
                    .filter(|token| !token.is_empty())
                    .ok_or(IdentityError::MissingToken)?;
                let claims = decode::<IdentityClaims>(token, key, validation)?.claims;
                build_identity(&claims.sub, &claims.role)
            }
            IdentityVerifier::Trusted => {
                let user_id = query
                    .user_id
                    .as_deref()
                    .ok_or(IdentityError::MissingIdentity)?;
                let role = query.role.as_deref().ok_or(IdentityError::MissingIdentity)?;
                build_identity(user_id, role)
            }
        }
    }
}

fn build_identity(user_id: &str, role: &str) -> Result<Identity, IdentityError> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(IdentityError::MissingIdentity);
    }
    let role = role.parse().map_err(IdentityError::InvalidRole)?;
    Ok(Identity {
        user_id: user_id.to_string(),
        role,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct Claims<'a> {
        sub: &'a str,
        role: &'a str,
        exp: u64,
    }

    fn token(secret: &str, sub: &str, role: &str, exp: u64) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &Claims { sub, role, exp },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn far_future() -> u64 {
        (chrono::Utc::now().timestamp() + 3_600) as u64
    }

    #[test_timeout::timeout]
    fn trusted_mode_reads_query_identity() {
        let verifier = IdentityVerifier::from_secret(None);
        let identity = verifier
            .resolve(&IdentityQuery {
                user_id: Some("dr-who".into()),
                role: Some("doctor".into()),
                ..IdentityQuery::default()
            })
            .unwrap();
        assert_eq!(identity.user_id, "dr-who");
        assert_eq!(identity.role, ParticipantRole::Doctor);
    }

    #[test_timeout::timeout]
    fn trusted_mode_requires_both_fields() {
        let verifier = IdentityVerifier::Trusted;
        let err = verifier
            .resolve(&IdentityQuery {
                user_id: Some("p1".into()),
                ..IdentityQuery::default()
            })
            .unwrap_err();
        assert!(matches!(err, IdentityError::MissingIdentity));
    }

    #[test_timeout::timeout]
    fn jwt_mode_accepts_valid_tokens() {
        let verifier = IdentityVerifier::from_secret(Some("s3cret"));
        let identity = verifier
            .resolve(&IdentityQuery {
                token: Some(token("s3cret", "patient-7", "patient", far_future())),
                ..IdentityQuery::default()
            })
            .unwrap();
        assert_eq!(identity.user_id, "patient-7");
        assert_eq!(identity.role, ParticipantRole::Patient);
    }

    #[test_timeout::timeout]
    fn jwt_mode_rejects_wrong_secret_and_ignores_query_identity() {
        let verifier = IdentityVerifier::from_secret(Some("s3cret"));
        let err = verifier
            .resolve(&IdentityQuery {
                token: Some(token("other", "patient-7", "patient", far_future())),
                ..IdentityQuery::default()
            })
            .unwrap_err();
        assert!(matches!(err, IdentityError::InvalidToken(_)));

        let err = verifier
            .resolve(&IdentityQuery {
                user_id: Some("patient-7".into()),
                role: Some("patient".into()),
                ..IdentityQuery::default()
            })
            .unwrap_err();
        assert!(matches!(err, IdentityError::MissingToken));
    }

    #[test_timeout::timeout]
    fn unknown_roles_are_refused() {
        let verifier = IdentityVerifier::from_secret(Some("s3cret"));
        let err = verifier
            .resolve(&IdentityQuery {
                token: Some(token("s3cret", "x", "janitor", far_future())),
                ..IdentityQuery::default()
            })
            .unwrap_err();
        assert_eq!(err.metric_label(), "invalid_role");
    }
}
