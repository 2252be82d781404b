//! Reconciliation rules between local and remote state.
//!
//! Two decisions live here, both pure:
//!
//! 1. When the remote rejects an outgoing mutation because its expected
//!    version is stale, [`Reconciler::resolve_conflict`] picks the outcome
//!    from the mutation kind, the remote's current state and the configured
//!    [`ConflictPolicy`].
//! 2. When a record arrives from the remote (subscription or initial sync),
//!    [`Reconciler::remote_disposition`] decides whether to apply it or drop
//!    it in favor of local state.
//!
//! The default policy is remote-wins: a conflicted local mutation is
//! discarded and the remote record is adopted.

use crate::{error::Result, MutationKind, Record, Schema, SyncMetadata, Timestamp, Version};
use std::sync::Arc;

/// The remote's view of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub record: Record,
    pub version: Version,
    pub deleted: bool,
    pub last_changed_at: Timestamp,
}

impl RemoteRecord {
    pub fn new(record: Record, version: Version) -> Self {
        Self {
            record,
            version,
            deleted: false,
            last_changed_at: 0,
        }
    }

    /// Builder-style method to mark the record deleted.
    pub fn with_deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    pub fn with_last_changed_at(mut self, last_changed_at: Timestamp) -> Self {
        self.last_changed_at = last_changed_at;
        self
    }

    /// Sync metadata recording this remote state.
    pub fn metadata(&self, schema: &Schema) -> Result<SyncMetadata> {
        Ok(SyncMetadata::new(
            schema.name.clone(),
            schema.identifier(&self.record)?,
            self.version,
            self.deleted,
            self.last_changed_at,
        ))
    }

    /// Kind of the event announcing this state locally.
    pub fn mutation_kind(&self) -> MutationKind {
        if self.deleted {
            MutationKind::Delete
        } else if self.version == 1 {
            MutationKind::Create
        } else {
            MutationKind::Update
        }
    }
}

/// What a conflict policy wants done with a conflicted local mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResolution {
    /// Discard the local mutation and adopt the remote record
    ApplyRemote,
    /// Resend the local payload against the remote's version
    RetryLocal,
    /// Resend this merged record against the remote's version
    Retry(Record),
}

/// A stale-version rejection handed to a conflict policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    /// Kind of the rejected local mutation
    pub kind: MutationKind,
    /// Local payload that was sent
    pub local: Record,
    /// Remote state that won the race
    pub remote: RemoteRecord,
}

/// Custom merge function.
pub type ConflictHandler = Arc<dyn Fn(&Conflict) -> ConflictResolution + Send + Sync>;

/// Conflict resolution policy.
#[derive(Clone, Default)]
pub enum ConflictPolicy {
    /// Adopt the remote record (default)
    #[default]
    RemoteWins,
    /// Resend the local payload against the remote version
    LocalWins,
    /// Ask an application-supplied function
    Custom(ConflictHandler),
}

impl std::fmt::Debug for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictPolicy::RemoteWins => write!(f, "RemoteWins"),
            ConflictPolicy::LocalWins => write!(f, "LocalWins"),
            ConflictPolicy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl ConflictPolicy {
    /// Wrap a merge function.
    pub fn custom<F>(handler: F) -> Self
    where
        F: Fn(&Conflict) -> ConflictResolution + Send + Sync + 'static,
    {
        ConflictPolicy::Custom(Arc::new(handler))
    }

    pub fn resolve(&self, conflict: &Conflict) -> ConflictResolution {
        match self {
            ConflictPolicy::RemoteWins => ConflictResolution::ApplyRemote,
            ConflictPolicy::LocalWins => ConflictResolution::RetryLocal,
            ConflictPolicy::Custom(handler) => handler(conflict),
        }
    }
}

/// Outcome of a stale-version conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictOutcome {
    /// Both sides already agree the record is deleted
    Converged,
    /// Write the remote record locally and drop the entry
    ApplyRemote,
    /// The remote deleted the record; delete it locally and drop the entry
    DeleteLocal,
    /// Send again against `version`, with `record` replacing the payload
    /// when present
    Retry {
        record: Option<Record>,
        version: Version,
    },
    /// Automatic resolution is off; report the conflict
    Unresolved,
}

/// Why a remote record was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Local mutations for the record are still queued
    PendingLocalMutations,
    /// Local state is already at or past the remote version
    StaleVersion { local: Version, remote: Version },
}

/// What to do with a record received from the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteDisposition {
    Apply(MutationKind),
    Drop(DropReason),
}

/// The reconciler applies the conflict policy and remote dispositions.
#[derive(Debug, Clone)]
pub struct Reconciler {
    policy: ConflictPolicy,
    auto_resolve: bool,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(ConflictPolicy::default())
    }
}

impl Reconciler {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            policy,
            auto_resolve: true,
        }
    }

    /// Builder-style switch for automatic conflict resolution.
    pub fn with_auto_resolve(mut self, auto_resolve: bool) -> Self {
        self.auto_resolve = auto_resolve;
        self
    }

    pub fn policy(&self) -> &ConflictPolicy {
        &self.policy
    }

    /// Decide how a stale-version rejection of `kind` is resolved.
    pub fn resolve_conflict(
        &self,
        kind: MutationKind,
        local: &Record,
        remote: &RemoteRecord,
    ) -> ConflictOutcome {
        if !self.auto_resolve {
            return ConflictOutcome::Unresolved;
        }

        match kind {
            MutationKind::Create => return ConflictOutcome::ApplyRemote,
            MutationKind::Delete if remote.deleted => return ConflictOutcome::Converged,
            MutationKind::Update if remote.deleted => return ConflictOutcome::DeleteLocal,
            MutationKind::Delete | MutationKind::Update => {}
        }

        let conflict = Conflict {
            kind,
            local: local.clone(),
            remote: remote.clone(),
        };
        match self.policy.resolve(&conflict) {
            ConflictResolution::ApplyRemote => ConflictOutcome::ApplyRemote,
            ConflictResolution::RetryLocal => ConflictOutcome::Retry {
                record: None,
                version: remote.version,
            },
            ConflictResolution::Retry(record) => ConflictOutcome::Retry {
                record: Some(record),
                version: remote.version,
            },
        }
    }

    /// Decide whether a remote record should be applied locally.
    ///
    /// Queued local mutations take precedence; they will reach the remote
    /// and come back as their own version. A remote version that does not
    /// advance local metadata has already been applied.
    pub fn remote_disposition(
        &self,
        remote: &RemoteRecord,
        local: Option<&SyncMetadata>,
        has_pending: bool,
    ) -> RemoteDisposition {
        if has_pending {
            return RemoteDisposition::Drop(DropReason::PendingLocalMutations);
        }
        if let Some(local) = local {
            if !local.advances_to(remote.version) {
                return RemoteDisposition::Drop(DropReason::StaleVersion {
                    local: local.version,
                    remote: remote.version,
                });
            }
        }
        RemoteDisposition::Apply(remote.mutation_kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(title: &str) -> Record {
        Record::new("Post").with("id", "1").with("title", title)
    }

    fn remote(title: &str, version: Version) -> RemoteRecord {
        RemoteRecord::new(post(title), version)
    }

    #[test]
    fn remote_wins_by_default() {
        let reconciler = Reconciler::default();
        let outcome = reconciler.resolve_conflict(
            MutationKind::Update,
            &post("local"),
            &remote("remote", 3),
        );
        assert_eq!(outcome, ConflictOutcome::ApplyRemote);
    }

    #[test]
    fn local_wins_retries_against_remote_version() {
        let reconciler = Reconciler::new(ConflictPolicy::LocalWins);
        let outcome = reconciler.resolve_conflict(
            MutationKind::Update,
            &post("local"),
            &remote("remote", 3),
        );
        assert_eq!(
            outcome,
            ConflictOutcome::Retry {
                record: None,
                version: 3
            }
        );
    }

    #[test]
    fn custom_merge() {
        let reconciler = Reconciler::new(ConflictPolicy::custom(|conflict| {
            let local = conflict.local.get_raw("title").and_then(|v| v.as_text());
            let remote = conflict.remote.record.get_raw("title").and_then(|v| v.as_text());
            let merged = format!("{}+{}", local.unwrap_or(""), remote.unwrap_or(""));
            ConflictResolution::Retry(conflict.local.clone().with("title", merged))
        }));

        match reconciler.resolve_conflict(MutationKind::Update, &post("a"), &remote("b", 5)) {
            ConflictOutcome::Retry {
                record: Some(record),
                version,
            } => {
                assert_eq!(version, 5);
                assert_eq!(record.get_raw("title"), Some(&crate::Value::from("a+b")));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn kind_specific_rules() {
        let reconciler = Reconciler::new(ConflictPolicy::LocalWins);

        assert_eq!(
            reconciler.resolve_conflict(MutationKind::Create, &post("l"), &remote("r", 1)),
            ConflictOutcome::ApplyRemote
        );

        let gone = remote("r", 4).with_deleted(true);
        assert_eq!(
            reconciler.resolve_conflict(MutationKind::Delete, &post("l"), &gone),
            ConflictOutcome::Converged
        );
        assert_eq!(
            reconciler.resolve_conflict(MutationKind::Update, &post("l"), &gone),
            ConflictOutcome::DeleteLocal
        );
    }

    #[test]
    fn opting_out_leaves_conflicts_unresolved() {
        let reconciler = Reconciler::default().with_auto_resolve(false);
        assert_eq!(
            reconciler.resolve_conflict(MutationKind::Update, &post("l"), &remote("r", 2)),
            ConflictOutcome::Unresolved
        );
    }

    #[test]
    fn remote_dispositions() {
        let reconciler = Reconciler::default();
        let incoming = remote("r", 3);

        assert_eq!(
            reconciler.remote_disposition(&incoming, None, false),
            RemoteDisposition::Apply(MutationKind::Update)
        );
        assert_eq!(
            reconciler.remote_disposition(&incoming, None, true),
            RemoteDisposition::Drop(DropReason::PendingLocalMutations)
        );

        let newer = SyncMetadata::new("Post", "1", 4, false, 0);
        assert_eq!(
            reconciler.remote_disposition(&incoming, Some(&newer), false),
            RemoteDisposition::Drop(DropReason::StaleVersion {
                local: 4,
                remote: 3
            })
        );

        let same = SyncMetadata::new("Post", "1", 3, false, 0);
        assert!(matches!(
            reconciler.remote_disposition(&incoming, Some(&same), false),
            RemoteDisposition::Drop(_)
        ));

        let older = SyncMetadata::new("Post", "1", 2, false, 0);
        assert_eq!(
            reconciler.remote_disposition(&incoming, Some(&older), false),
            RemoteDisposition::Apply(MutationKind::Update)
        );
    }

    #[test]
    fn event_kind_from_remote_state() {
        assert_eq!(remote("r", 1).mutation_kind(), MutationKind::Create);
        assert_eq!(remote("r", 2).mutation_kind(), MutationKind::Update);
        assert_eq!(
            remote("r", 2).with_deleted(true).mutation_kind(),
            MutationKind::Delete
        );
    }
}
