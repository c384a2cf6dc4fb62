//! QueueName - 検証済みのキュー名

use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::LeaseError;

/// キュー名。空文字や空白だけの名前は作れない
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    pub const DEFAULT: &'static str = "default";

    pub fn new(name: impl Into<String>) -> Result<Self, LeaseError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(LeaseError::InvalidArgument(
                "queue name must not be empty".to_string(),
            ));
        }
        Ok(Self(name))
    }

    pub fn default_queue() -> Self {
        Self(Self::DEFAULT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for QueueName {
    type Error = LeaseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(value: QueueName) -> Self {
        value.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
