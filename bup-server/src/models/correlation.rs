use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque token pairing a client request with the messages it causes.
///
/// Passed explicitly through every call that may end up emitting a message, so
/// broadcasts triggered by a command still carry that command's token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Correlation(Option<String>);

impl Correlation {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn token(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }
}

impl From<Option<String>> for Correlation {
    fn from(token: Option<String>) -> Self {
        Self(token)
    }
}

impl fmt::Display for Correlation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token().unwrap_or("-"))
    }
}
