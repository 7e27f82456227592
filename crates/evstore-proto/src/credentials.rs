//! Login/password pair carried by authenticated packages.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, ProtoResult};

/// Login and password are each framed behind a single length byte.
pub const MAX_CREDENTIAL_LEN: usize = u8::MAX as usize;

/// User credentials for a single request or subscription.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
}

impl UserCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Check that both fields fit their one-byte length prefix.
    pub fn validate(&self) -> ProtoResult<()> {
        for (field, value) in [("login", &self.username), ("password", &self.password)] {
            if value.len() > MAX_CREDENTIAL_LEN {
                return Err(ProtoError::CredentialsTooLong {
                    field,
                    len: value.len(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
