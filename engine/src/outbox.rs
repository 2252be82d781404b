//! Outbox entries and their delivery state machine.
//!
//! An [`OutboxEntry`] wraps a local [`MutationEvent`] that has not yet been
//! acknowledged by the remote. Entries move through
//!
//! ```text
//! pending → in-flight → acknowledged
//!               │  ↑
//!               │  └── release (delivery cancelled)
//!               └──→ conflict → pending (retry with merged payload)
//!                        └────→ removed (terminal failure, reported)
//! ```
//!
//! [`ingest`] decides how a new local mutation joins the entries already
//! queued for the same record.

use crate::{error::Result, Error, EventId, MutationEvent, MutationKind, Version};
use serde::{Deserialize, Serialize};

/// Delivery state of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    InFlight,
    Acknowledged,
    Conflict,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::InFlight => "in_flight",
            DeliveryState::Acknowledged => "acknowledged",
            DeliveryState::Conflict => "conflict",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DeliveryState::Pending),
            "in_flight" => Ok(DeliveryState::InFlight),
            "acknowledged" => Ok(DeliveryState::Acknowledged),
            "conflict" => Ok(DeliveryState::Conflict),
            other => Err(Error::InvalidPayload(format!(
                "unknown delivery state: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    /// Enqueue order
    pub seq: i64,
    pub event: MutationEvent,
    pub state: DeliveryState,
    /// Delivery attempts so far
    pub attempts: u32,
    /// Remote version reported by the last conflict
    pub remote_version: Option<Version>,
}

impl OutboxEntry {
    /// Create a new pending entry.
    pub fn new(seq: i64, event: MutationEvent) -> Self {
        Self {
            seq,
            event,
            state: DeliveryState::Pending,
            attempts: 0,
            remote_version: None,
        }
    }

    pub fn id(&self) -> &EventId {
        &self.event.id
    }

    fn transition(&mut self, from: &[DeliveryState], to: DeliveryState) -> Result<()> {
        if !from.contains(&self.state) {
            return Err(Error::InvalidTransition {
                entry_id: self.event.id.clone(),
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }

    /// `pending → in-flight`
    pub fn begin_delivery(&mut self) -> Result<()> {
        self.transition(&[DeliveryState::Pending], DeliveryState::InFlight)?;
        self.attempts += 1;
        Ok(())
    }

    /// `in-flight → acknowledged`
    pub fn acknowledge(&mut self) -> Result<()> {
        self.transition(&[DeliveryState::InFlight], DeliveryState::Acknowledged)
    }

    /// `in-flight → conflict`
    pub fn mark_conflict(&mut self, remote_version: Version) -> Result<()> {
        self.transition(&[DeliveryState::InFlight], DeliveryState::Conflict)?;
        self.remote_version = Some(remote_version);
        Ok(())
    }

    /// `in-flight → pending`, when delivery was cancelled.
    pub fn release(&mut self) -> Result<()> {
        self.transition(&[DeliveryState::InFlight], DeliveryState::Pending)
    }

    /// `conflict → pending`, resending against `version`.
    ///
    /// `payload` replaces the queued payload when the conflict was resolved
    /// by merging.
    pub fn retry_with(
        &mut self,
        payload: Option<serde_json::Value>,
        version: Version,
    ) -> Result<()> {
        self.transition(&[DeliveryState::Conflict], DeliveryState::Pending)?;
        if let Some(payload) = payload {
            self.event.payload = payload;
        }
        self.event.version = Some(version);
        Ok(())
    }

    /// Whether the entry may be removed as a terminal failure.
    pub fn can_fail(&self) -> bool {
        self.state != DeliveryState::Acknowledged
    }
}

/// How a new local mutation joins the outbox.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingest {
    /// Queue the candidate as a new entry
    Append,
    /// Overwrite the latest pending entry with this merged event
    Replace(MutationEvent),
    /// The record never reached the remote; remove the latest entry and
    /// queue nothing
    DropBoth,
}

/// Decide how `candidate` joins the queue given the latest entry for the
/// same record.
///
/// Merging only happens with an entry that is still `pending`; anything
/// already handed to the remote is left alone so its outcome is observed in
/// order. Merged entries keep the existing entry's id and expected version.
pub fn ingest(existing: Option<&OutboxEntry>, candidate: &MutationEvent) -> Result<Ingest> {
    let existing = match existing {
        Some(entry)
            if entry.state == DeliveryState::Pending
                && entry.event.schema_name == candidate.schema_name
                && entry.event.record_id == candidate.record_id =>
        {
            entry
        }
        _ => return Ok(Ingest::Append),
    };

    use MutationKind::*;
    let merged_kind = match (existing.event.kind, candidate.kind) {
        (Create, Update) => Create,
        (Update, Update) | (Update, Delete) | (Delete, Delete) => candidate.kind,
        (Create, Delete) => return Ok(Ingest::DropBoth),
        (Delete, Create) => return Ok(Ingest::Append),
        (Create, Create) => {
            return Err(Error::InvalidMutation {
                record_id: candidate.record_id.clone(),
                reason: "create queued for a record with a pending create".into(),
            })
        }
        (Delete, Update) | (Update, Create) => {
            return Err(Error::InvalidMutation {
                record_id: candidate.record_id.clone(),
                reason: format!(
                    "{} queued after a pending {}",
                    candidate.kind, existing.event.kind
                ),
            })
        }
    };

    Ok(Ingest::Replace(MutationEvent {
        id: existing.event.id.clone(),
        kind: merged_kind,
        version: existing.event.version,
        ..candidate.clone()
    }))
}
