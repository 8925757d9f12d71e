//! Handshake tokens binding a bridge connection to a launched tenant.
//!
//! The executor issues a fresh token for every start and hands it to the
//! wrapper through its environment. A `hello` is accepted only when it
//! presents the token issued for the alias it claims.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

/// Tokens issued per alias.
#[derive(Debug, Default)]
pub struct HelloTokens {
    issued: Mutex<HashMap<String, String>>,
}

impl HelloTokens {
    fn table(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.issued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue a token for `alias`, replacing any earlier one.
    #[must_use]
    pub fn issue(&self, alias: &str) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.table().insert(String::from(alias), token.clone());
        token
    }

    /// Forget the token for `alias`.
    pub fn revoke(&self, alias: &str) {
        self.table().remove(alias);
    }

    /// Whether `token` is the one issued for `alias`.
    #[must_use]
    pub fn verify(&self, alias: &str, token: Option<&str>) -> bool {
        match (self.table().get(alias), token) {
            (Some(issued), Some(presented)) => issued == presented,
            _ => false,
        }
    }
}
