//! Conflict resolution policy
//!
//! Whole-record last-write-wins, ordered by the version the authoritative
//! store assigns:
//!
//! - no version: applied as provisional on top of the visible state,
//!   stamped with the event's own timestamp; the canonical version is
//!   left untouched
//! - version below the last canonical version: stale, discarded
//! - version at or above it: merged over the last canonical snapshot,
//!   which supersedes any provisional state
//!
//! Two unversioned writers racing on one entity resolve locally by arrival
//! order; the authoritative versions settle it once both are committed.

use crate::model::{merge_fields, EntityRecord, Fields};
use crate::protocol::{ChangeEvent, ChangeKind};
use serde::{Deserialize, Serialize};

/// Local state of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntity {
    /// Visible state; `None` once deleted
    pub current: Option<EntityRecord>,
    /// Last state confirmed by the authoritative store
    pub canonical: Option<EntityRecord>,
    /// Version of the last canonical event, 0 if never confirmed
    pub canonical_version: u64,
    /// `current` includes unconfirmed changes
    pub provisional: bool,
}

impl CachedEntity {
    pub fn is_deleted(&self) -> bool {
        self.current.is_none()
    }
}

/// What applying an event did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Unversioned state applied, pending confirmation
    Provisional,
    /// Versioned state applied
    Canonical,
    /// Older than the local canonical version
    Stale,
    /// Already applied
    Duplicate,
    /// Not for this peer: own broadcast echo or another workspace
    Ignored,
}

impl ApplyOutcome {
    /// Whether local state changed
    pub fn changed(&self) -> bool {
        matches!(self, ApplyOutcome::Provisional | ApplyOutcome::Canonical)
    }
}

/// Decision for one incoming event
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Provisional(CachedEntity),
    Canonical(CachedEntity),
    Stale { incoming: u64, local: u64 },
    Duplicate,
}

impl Resolution {
    pub fn outcome(&self) -> ApplyOutcome {
        match self {
            Resolution::Provisional(_) => ApplyOutcome::Provisional,
            Resolution::Canonical(_) => ApplyOutcome::Canonical,
            Resolution::Stale { .. } => ApplyOutcome::Stale,
            Resolution::Duplicate => ApplyOutcome::Duplicate,
        }
    }
}

/// Decide how `event` changes `local`. `now` stamps `updated_at` of
/// canonical state.
///
/// Re-delivering an event that leaves `local` unchanged is a
/// [`Resolution::Duplicate`].
pub fn resolve(local: Option<&CachedEntity>, event: &ChangeEvent, now: i64) -> Resolution {
    let local_version = local.map(|entity| entity.canonical_version).unwrap_or(0);
    let empty = Fields::new();
    let incoming = event.payload.as_ref().unwrap_or(&empty);

    let Some(version) = event.version else {
        let base = local.and_then(|entity| entity.current.as_ref());
        let current = match event.kind {
            ChangeKind::Upsert => Some(EntityRecord::new(
                event.entity_id.clone(),
                event.workspace_id.clone(),
                local_version,
                merge_fields(base.map(|record| &record.fields).unwrap_or(&empty), incoming),
                event.timestamp,
            )),
            ChangeKind::Delete => None,
        };

        let next = CachedEntity {
            current,
            canonical: local.and_then(|entity| entity.canonical.clone()),
            canonical_version: local_version,
            provisional: true,
        };
        if local == Some(&next) {
            return Resolution::Duplicate;
        }
        return Resolution::Provisional(next);
    };

    if version < local_version {
        return Resolution::Stale {
            incoming: version,
            local: local_version,
        };
    }

    let base = local.and_then(|entity| entity.canonical.as_ref());
    let next_fields = match event.kind {
        ChangeKind::Upsert => Some(merge_fields(
            base.map(|record| &record.fields).unwrap_or(&empty),
            incoming,
        )),
        ChangeKind::Delete => None,
    };

    if let Some(entity) = local {
        let unchanged = entity.current.as_ref().map(|record| &record.fields) == next_fields.as_ref();
        if version == local_version && !entity.provisional && unchanged {
            return Resolution::Duplicate;
        }
    }

    let record = next_fields.map(|fields| {
        EntityRecord::new(
            event.entity_id.clone(),
            event.workspace_id.clone(),
            version,
            fields,
            now,
        )
    });

    Resolution::Canonical(CachedEntity {
        current: record.clone(),
        canonical: record,
        canonical_version: version,
        provisional: false,
    })
}
