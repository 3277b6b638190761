//! Caller provenance carried through a request for auditing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Caller context extracted from the request headers.
///
/// The engine never interprets these values, it only records them on ledger
/// rows as `session_owner` and `session`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserContext {
    /// User ID
    pub user_id: String,
    /// Caller-supplied session tag
    pub session: Option<String>,
    /// Any other headers, kept for logging
    pub metadata: HashMap<String, String>,
}

impl UserContext {
    pub fn new(user_id: String) -> Self {
        Self {
            user_id,
            session: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_session(user_id: String, session: String) -> Self {
        Self {
            user_id,
            session: Some(session),
            metadata: HashMap::new(),
        }
    }

    /// The user recorded as `session_owner`, if any.
    pub fn session_owner(&self) -> Option<String> {
        if self.user_id.is_empty() {
            None
        } else {
            Some(self.user_id.clone())
        }
    }

    pub fn set_metadata(&mut self, key: String, value: String) {
        self.metadata.insert(key, value);
    }

    pub fn get_metadata(&self, key: &str) -> Option<&String> {
        self.metadata.get(key)
    }
}

impl Default for UserContext {
    fn default() -> Self {
        Self::new(String::new())
    }
}
