// Copyright (c) 2023-2025 The Mesh Foundation

//! Append-only audit log of policy mutations.
//!
//! Every successful `set_manifest`, `update_manifest`, and `recover` appends
//! one entry per mutation. Entries are never rewritten or pruned; the log is
//! serialized into the sealed state so it survives restarts.

use chrono::{DateTime, SecondsFormat, Utc};
use displaydoc::Display;
use serde::{Deserialize, Serialize};

/// What a log entry records about a mutation.
#[derive(Clone, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
pub enum UpdateAction {
    /// set manifest with signature {digest}
    ManifestSet {
        /// Hex SHA-256 of the accepted manifest bytes.
        digest: String,
    },
    /// updated package {package} to security version {security_version}
    PackageUpdated {
        /// The package whose version was raised.
        package: String,
        /// The new security version.
        security_version: u64,
    },
    /// recovered sealed state with recovery key {key}
    Recovered {
        /// Name of the recovery key that authorized the restore.
        key: String,
    },
}

/// One committed mutation.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct UpdateLogEntry {
    /// When the mutation committed.
    pub timestamp: DateTime<Utc>,
    /// Common name of the authenticated admin (or `bootstrap` for the
    /// initial manifest).
    pub admin: String,
    /// The mutation itself.
    pub action: UpdateAction,
}

impl UpdateLogEntry {
    fn render(&self) -> String {
        format!(
            "{} {}: {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.admin,
            self.action
        )
    }
}

/// The append-only log.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct UpdateLog {
    entries: Vec<UpdateLogEntry>,
}

impl UpdateLog {
    /// Append an entry stamped with the current wall clock.
    pub fn append(&mut self, admin: &str, action: UpdateAction) {
        self.entries.push(UpdateLogEntry {
            timestamp: Utc::now(),
            admin: admin.to_string(),
            action,
        });
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entries, oldest first.
    pub fn entries(&self) -> &[UpdateLogEntry] {
        &self.entries
    }

    /// Render the log for the client API, one entry per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.render());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_accumulate_in_commit_order() {
        let mut log = UpdateLog::default();
        assert!(log.is_empty());

        log.append(
            "bootstrap",
            UpdateAction::ManifestSet {
                digest: "ab".repeat(32),
            },
        );
        log.append(
            "owner",
            UpdateAction::PackageUpdated {
                package: "frontend".into(),
                security_version: 5,
            },
        );

        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[0].admin, "bootstrap");
        assert_eq!(log.entries()[1].admin, "owner");
        assert!(log.entries()[0].timestamp <= log.entries()[1].timestamp);
    }

    #[test]
    fn render_is_one_line_per_entry() {
        let mut log = UpdateLog::default();
        log.append(
            "owner",
            UpdateAction::PackageUpdated {
                package: "frontend".into(),
                security_version: 5,
            },
        );

        let text = log.render();
        assert_eq!(text.lines().count(), 1);
        let line = text.lines().next().unwrap();
        assert!(
            line.ends_with("owner: updated package frontend to security version 5"),
            "{line}"
        );
        // RFC 3339 timestamp leads the line
        assert!(line.contains('T') && line.contains('Z'), "{line}");
    }

    #[test]
    fn log_round_trips_through_serde() {
        let mut log = UpdateLog::default();
        log.append(
            "recovery",
            UpdateAction::Recovered {
                key: "admin".into(),
            },
        );
        let encoded = serde_json::to_vec(&log).unwrap();
        let decoded: UpdateLog = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.entries(), log.entries());
    }
}
