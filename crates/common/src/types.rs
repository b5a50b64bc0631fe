use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::Error;

/// Where an outbound message goes: a chat plus an optional thread inside it.
///
/// Two targets are equal only when both parts match. An absent thread is its
/// own value, so `(chat, None)` never matches `(chat, Some(_))`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatTarget {
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

impl ChatTarget {
    #[must_use]
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            thread: None,
        }
    }

    #[must_use]
    pub fn with_thread(mut self, thread: impl Into<String>) -> Self {
        self.thread = Some(thread.into());
        self
    }

    /// Build a target from an optional thread, as it usually arrives from config.
    #[must_use]
    pub fn in_thread(destination: impl Into<String>, thread: Option<String>) -> Self {
        Self {
            destination: destination.into(),
            thread,
        }
    }

    pub fn thread(&self) -> Option<&str> {
        self.thread.as_deref()
    }
}

impl fmt::Display for ChatTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.thread {
            Some(thread) => write!(f, "{}#{thread}", self.destination),
            None => f.write_str(&self.destination),
        }
    }
}

/// Parses `chat` or `chat#thread`.
impl FromStr for ChatTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (destination, thread) = match s.split_once('#') {
            Some((dest, thread)) => (dest.trim(), Some(thread.trim())),
            None => (s.trim(), None),
        };
        if destination.is_empty() {
            return Err(Error::invalid_target("destination is empty"));
        }
        match thread {
            Some("") => Err(Error::invalid_target("thread is empty")),
            Some(thread) => Ok(Self::new(destination).with_thread(thread)),
            None => Ok(Self::new(destination)),
        }
    }
}
