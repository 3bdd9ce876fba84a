//! Shared identifier wrappers for Engram.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Error returned when parsing a UUID-backed identifier fails.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct IdParseError {
    message: String,
}

impl IdParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

macro_rules! define_uuid_id {
    ($name:ident, $label:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                Uuid::parse_str(value)
                    .map_err(|e| IdParseError::new(format!("Invalid {}: {}", $label, e)))?;
                Ok(Self(value.to_string()))
            }

            /// Wrap an identifier that did not originate here (e.g. an
            /// editor-assigned session id). No format validation.
            pub fn from_raw(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

define_uuid_id!(TaskId, "task ID");
define_uuid_id!(WorkerId, "worker ID");
define_uuid_id!(TokenId, "token ID");
define_uuid_id!(SessionId, "session ID");

/// Hub identifiers are not UUID-backed: the builtin hub has a fixed
/// well-known id and external hubs may use operator-chosen names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct HubId(String);

impl HubId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn generate() -> Self {
        Self(format!("hub-{}", Uuid::new_v4()))
    }

    pub fn builtin() -> Self {
        Self(crate::defaults::BUILTIN_HUB_ID.to_string())
    }

    pub fn is_builtin(&self) -> bool {
        self.0 == crate::defaults::BUILTIN_HUB_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for HubId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_roundtrip() {
        let id = TaskId::new();
        let parsed = TaskId::parse(id.as_str()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_task_id_rejects_garbage() {
        assert!(TaskId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_builtin_hub_id() {
        assert!(HubId::builtin().is_builtin());
        assert!(!HubId::new("hub-eu-west").is_builtin());
    }
}
