//! Receive-side matching of server messages.

use bup_server::ws::protocol::{MessageKind, Outgoing};
use std::collections::HashSet;

/// Selects messages by type and, optionally, by correlation token.
///
/// A filter with no correlation set matches messages regardless of their
/// token. A filter with one only matches messages carrying a token from it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    kinds: Option<HashSet<MessageKind>>,
    correlations: Option<HashSet<String>>,
}

impl MessageFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn kind(kind: MessageKind) -> Self {
        Self::kinds([kind])
    }

    pub fn kinds(kinds: impl IntoIterator<Item = MessageKind>) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
            correlations: None,
        }
    }

    pub fn correlated(self, token: impl Into<String>) -> Self {
        self.correlated_any([token.into()])
    }

    pub fn correlated_any(mut self, tokens: impl IntoIterator<Item = String>) -> Self {
        self.correlations
            .get_or_insert_with(HashSet::new)
            .extend(tokens);
        self
    }

    pub fn matches(&self, outgoing: &Outgoing) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&outgoing.message.kind()) {
                return false;
            }
        }
        match (&self.correlations, outgoing.correlation.token()) {
            (None, _) => true,
            (Some(tokens), Some(token)) => tokens.contains(token),
            (Some(_), None) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bup_server::models::Correlation;
    use bup_server::ws::protocol::ServerMessage;

    fn error(correlation: Correlation) -> Outgoing {
        Outgoing::new(
            ServerMessage::ClientError {
                error: "boom".into(),
            },
            &correlation,
        )
    }

    fn revisions(correlation: Correlation) -> Outgoing {
        Outgoing::new(
            ServerMessage::BackupRevisions {
                id: "b1".into(),
                revisions: vec![],
            },
            &correlation,
        )
    }

    #[test]
    fn test_kind_filter() {
        let filter = MessageFilter::kind(MessageKind::ClientError);
        assert!(filter.matches(&error(Correlation::none())));
        assert!(filter.matches(&error(Correlation::new("c1"))));
        assert!(!filter.matches(&revisions(Correlation::none())));
        assert!(MessageFilter::any().matches(&revisions(Correlation::new("c1"))));
    }

    #[test]
    fn test_correlation_filter() {
        let filter = MessageFilter::kind(MessageKind::BackupRevisions).correlated("c1");
        assert!(filter.matches(&revisions(Correlation::new("c1"))));
        assert!(!filter.matches(&revisions(Correlation::new("c2"))));
        assert!(!filter.matches(&revisions(Correlation::none())));
    }

    #[test]
    fn test_correlation_set() {
        let filter = MessageFilter::any().correlated_any(["c1".to_string(), "c2".to_string()]);
        assert!(filter.matches(&error(Correlation::new("c2"))));
        assert!(!filter.matches(&error(Correlation::new("c3"))));
    }
}
