use super::IdentityProvider;
use crate::error::{AppError, AppResult};
use crate::models::Viewer;
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use uuid::Uuid;

/// Claims issued by the identity service.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    pub exp: usize,
    #[serde(default)]
    pub email: Option<String>,
}

/// Session backed by an HS256 access token.
///
/// A missing, expired or otherwise invalid token is treated as "no session".
pub struct JwtIdentity {
    decoding_key: DecodingKey,
    validation: Validation,
    token: RwLock<Option<String>>,
}

impl JwtIdentity {
    pub fn new(secret: &str, token: Option<String>) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            token: RwLock::new(token),
        }
    }

    pub fn set_token(&self, token: Option<String>) -> AppResult<()> {
        let mut guard = self
            .token
            .write()
            .map_err(|_| AppError::Config("session lock poisoned".into()))?;
        *guard = token;
        Ok(())
    }

    fn viewer_from_token(&self, token: &str) -> Option<Viewer> {
        let data = match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(error = %e, "Rejected session token");
                return None;
            }
        };

        match Uuid::parse_str(&data.claims.sub) {
            Ok(id) => Some(Viewer {
                id,
                email: data.claims.email,
            }),
            Err(_) => {
                tracing::warn!(sub = %data.claims.sub, "Session token subject is not a user id");
                None
            }
        }
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentity {
    async fn current_viewer(&self) -> AppResult<Option<Viewer>> {
        let token = self
            .token
            .read()
            .map_err(|_| AppError::Config("session lock poisoned".into()))?
            .clone();

        Ok(token.and_then(|t| self.viewer_from_token(&t)))
    }
}

/// Fixed session, for local tooling and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity(pub Option<Viewer>);

impl StaticIdentity {
    pub fn signed_in(id: Uuid) -> Self {
        Self(Some(Viewer { id, email: None }))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_viewer(&self) -> AppResult<Option<Viewer>> {
        Ok(self.0.clone())
    }
}
