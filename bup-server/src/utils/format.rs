use chrono::{DateTime, Utc};

/// Name bup gives a saved revision: `YYYY-MM-DD-HHMMSS` in UTC.
pub fn revision_name(revision: &DateTime<Utc>) -> String {
    revision.format("%Y-%m-%d-%H%M%S").to_string()
}
