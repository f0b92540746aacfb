use crate::services::archive::ToolError;
use crate::services::runner::RunError;

/// Failure of a client command. Every variant becomes a `client-error`.
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Precondition(String),

    #[error("{0}")]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation(message.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        AppError::Precondition(message.into())
    }

    /// The text sent back in a `client-error` message.
    pub fn client_message(&self) -> String {
        match self {
            AppError::Validation(m) | AppError::Precondition(m) => m.clone(),
            AppError::Tool(e) => e.detail(),
            AppError::Run(e) => e.to_string(),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                "Internal server error".into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages() {
        assert_eq!(
            AppError::validation("Missing required info: name").client_message(),
            "Missing required info: name"
        );
        let tool = AppError::from(ToolError::classify("bup gc", Some(1), "gc: locked\n".into()));
        assert_eq!(tool.client_message(), "gc: locked");
        let internal = AppError::from(anyhow::anyhow!("disk on fire"));
        assert_eq!(internal.client_message(), "Internal server error");
    }
}
