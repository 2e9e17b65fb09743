use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::domain::GuardianIdentity;
use super::error::EnrollmentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Guardian,
    Admin,
}

impl Role {
    pub const fn label(self) -> &'static str {
        match self {
            Role::Guardian => "guardian",
            Role::Admin => "admin",
        }
    }
}

/// Authenticated caller, passed explicitly into every core operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub identity: GuardianIdentity,
    pub role: Role,
    pub email: Option<String>,
}

impl Principal {
    pub fn guardian(identity: impl Into<String>, email: Option<&str>) -> Self {
        Self {
            identity: GuardianIdentity(identity.into()),
            role: Role::Guardian,
            email: email.map(str::to_string),
        }
    }

    pub fn admin(identity: impl Into<String>) -> Self {
        Self {
            identity: GuardianIdentity(identity.into()),
            role: Role::Admin,
            email: None,
        }
    }

    pub fn require_admin(&self) -> Result<(), EnrollmentError> {
        match self.role {
            Role::Admin => Ok(()),
            Role::Guardian => Err(EnrollmentError::Forbidden(
                "administrator role required".to_string(),
            )),
        }
    }

    pub fn require_guardian(&self) -> Result<(), EnrollmentError> {
        match self.role {
            Role::Guardian => Ok(()),
            Role::Admin => Err(EnrollmentError::Forbidden(
                "only guardians submit enrollment forms".to_string(),
            )),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("missing bearer token")]
    MissingCredentials,
    #[error("invalid or expired token")]
    InvalidToken,
}

/// Resolves a bearer token into a principal.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Principal, IdentityError>;
}

/// Fixed token table, seeded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityProvider {
    tokens: HashMap<String, Principal>,
}

impl StaticIdentityProvider {
    pub fn new(entries: impl IntoIterator<Item = (String, Principal)>) -> Self {
        Self {
            tokens: entries.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, token: impl Into<String>, principal: Principal) {
        self.tokens.insert(token.into(), principal);
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn authenticate(&self, token: &str) -> Result<Principal, IdentityError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(IdentityError::MissingCredentials);
        }
        self.tokens
            .get(token)
            .cloned()
            .ok_or(IdentityError::InvalidToken)
    }
}
