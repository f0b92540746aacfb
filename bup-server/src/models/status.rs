use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── RunState ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    NeverRun,
    Idle,
    Indexing,
    Saving,
    Working,
}

impl RunState {
    /// True for the two phases owned by the run coordinator.
    pub fn is_running(self) -> bool {
        matches!(self, RunState::Indexing | RunState::Saving)
    }

    /// The resting state for a backup with or without a committed revision.
    pub fn settled(last_run: Option<&DateTime<Utc>>) -> Self {
        if last_run.is_some() {
            RunState::Idle
        } else {
            RunState::NeverRun
        }
    }
}

// ── Readiness ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "ReadinessRepr", try_from = "ReadinessRepr")]
pub enum Readiness {
    Runnable,
    RepoInaccessible,
    SourcesInaccessible { inaccessible_sources: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum BlockReason {
    RepoInaccessible,
    SourcesInaccessible,
}

/// Wire shape: `{ runnable, reason?, inaccessibleSources? }`
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadinessRepr {
    runnable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<BlockReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    inaccessible_sources: Vec<String>,
}

impl From<Readiness> for ReadinessRepr {
    fn from(readiness: Readiness) -> Self {
        match readiness {
            Readiness::Runnable => Self {
                runnable: true,
                reason: None,
                inaccessible_sources: Vec::new(),
            },
            Readiness::RepoInaccessible => Self {
                runnable: false,
                reason: Some(BlockReason::RepoInaccessible),
                inaccessible_sources: Vec::new(),
            },
            Readiness::SourcesInaccessible { inaccessible_sources } => Self {
                runnable: false,
                reason: Some(BlockReason::SourcesInaccessible),
                inaccessible_sources,
            },
        }
    }
}

impl TryFrom<ReadinessRepr> for Readiness {
    type Error = String;

    fn try_from(repr: ReadinessRepr) -> Result<Self, Self::Error> {
        match (repr.runnable, repr.reason) {
            (true, _) => Ok(Readiness::Runnable),
            (false, Some(BlockReason::RepoInaccessible)) => Ok(Readiness::RepoInaccessible),
            (false, Some(BlockReason::SourcesInaccessible)) => Ok(Readiness::SourcesInaccessible {
                inaccessible_sources: repr.inaccessible_sources,
            }),
            (false, None) => Err("readiness is not runnable but carries no reason".into()),
        }
    }
}

impl Readiness {
    /// Repository inaccessibility wins over inaccessible sources.
    pub fn evaluate(repo_accessible: bool, sources: &[SourceStatus]) -> Self {
        if !repo_accessible {
            return Readiness::RepoInaccessible;
        }

        let inaccessible_sources: Vec<String> = sources
            .iter()
            .filter(|s| !s.accessible)
            .map(|s| s.source.clone())
            .collect();

        if inaccessible_sources.is_empty() {
            Readiness::Runnable
        } else {
            Readiness::SourcesInaccessible { inaccessible_sources }
        }
    }

    pub fn is_runnable(&self) -> bool {
        matches!(self, Readiness::Runnable)
    }

    /// Human-readable reason, used in client errors.
    pub fn describe(&self) -> String {
        match self {
            Readiness::Runnable => "runnable".to_string(),
            Readiness::RepoInaccessible => "repo-inaccessible".to_string(),
            Readiness::SourcesInaccessible { inaccessible_sources } => {
                format!("sources-inaccessible: {}", inaccessible_sources.join(", "))
            }
        }
    }
}

// ── BackupStatus ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub source: String,
    pub accessible: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    pub backup_id: String,
    pub repo_accessible: bool,
    pub source_status: Vec<SourceStatus>,
    pub readiness: Readiness,
    pub last_run: Option<DateTime<Utc>>,
    pub branch_size: Option<u64>,
    pub status: RunState,
}

/// Fields to shallow-merge into a cached status; `None` leaves a field alone.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub status: Option<RunState>,
    pub last_run: Option<Option<DateTime<Utc>>>,
    pub branch_size: Option<Option<u64>>,
}

impl StatusPatch {
    pub fn status(status: RunState) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

impl BackupStatus {
    pub fn apply(&mut self, patch: StatusPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(last_run) = patch.last_run {
            self.last_run = last_run;
        }
        if let Some(branch_size) = patch.branch_size {
            self.branch_size = branch_size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(path: &str, accessible: bool) -> SourceStatus {
        SourceStatus {
            source: path.to_string(),
            accessible,
        }
    }

    #[test]
    fn test_runnable_when_everything_accessible() {
        let readiness = Readiness::evaluate(true, &[source("/a", true), source("/b", true)]);
        assert_eq!(readiness, Readiness::Runnable);
    }

    #[test]
    fn test_lists_exactly_the_inaccessible_sources() {
        let readiness = Readiness::evaluate(
            true,
            &[source("/a", false), source("/b", true), source("/c", false)],
        );
        assert_eq!(
            readiness,
            Readiness::SourcesInaccessible {
                inaccessible_sources: vec!["/a".to_string(), "/c".to_string()],
            }
        );
        assert!(!readiness.is_runnable());
    }

    #[test]
    fn test_repo_inaccessible_takes_precedence() {
        let readiness = Readiness::evaluate(false, &[source("/a", false)]);
        assert_eq!(readiness, Readiness::RepoInaccessible);
    }

    #[test]
    fn test_readiness_wire_shape() {
        let json = serde_json::to_value(Readiness::SourcesInaccessible {
            inaccessible_sources: vec!["/a".to_string()],
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "runnable": false,
                "reason": "sources-inaccessible",
                "inaccessibleSources": ["/a"],
            })
        );

        let runnable: Readiness = serde_json::from_str(r#"{"runnable":true}"#).unwrap();
        assert_eq!(runnable, Readiness::Runnable);
        assert!(serde_json::from_str::<Readiness>(r#"{"runnable":false}"#).is_err());
    }

    #[test]
    fn test_settled_state() {
        assert_eq!(RunState::settled(None), RunState::NeverRun);
        assert_eq!(RunState::settled(Some(&Utc::now())), RunState::Idle);
        assert!(RunState::Indexing.is_running());
        assert!(!RunState::Working.is_running());
    }

    #[test]
    fn test_patch_only_touches_given_fields() {
        let mut status = BackupStatus {
            backup_id: "1".to_string(),
            repo_accessible: true,
            source_status: vec![],
            readiness: Readiness::Runnable,
            last_run: None,
            branch_size: Some(10),
            status: RunState::Idle,
        };
        status.apply(StatusPatch::status(RunState::Working));
        assert_eq!(status.status, RunState::Working);
        assert_eq!(status.branch_size, Some(10));
    }
}
