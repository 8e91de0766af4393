//! Local configuration snapshot and change detection.
//!
//! A [`Snapshot`] is immutable once built; the [`SnapshotStore`] swaps whole
//! snapshots behind an `Arc` so readers never observe a partially applied
//! update. Every apply runs under a single lock that also covers the
//! [`UpdateSink`] dispatch, which keeps notifications ordered.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::SyncError;

/// Ordered key/value configuration items.
pub type ConfigItems = Map<String, Value>;

/// Dimension entry carrying the revision token in a full fetch response.
const REVISION_DIMENSION: &str = "revision";
/// Field of the revision entry holding the token.
const REVISION_VERSION_FIELD: &str = "version";
/// Field of a push frame carrying the incremental key/values.
const INCREMENTAL_VALUE_FIELD: &str = "value";

/// Incremental action upserting keys.
pub const ACTION_UPDATE: &str = "UPDATE";
/// Incremental action removing keys.
pub const ACTION_DELETE: &str = "DELETE";

/// Immutable view of the remote configuration at a given revision.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    items: ConfigItems,
    revision: String,
}

impl Snapshot {
    /// Builds a snapshot from already-merged items.
    pub fn new(items: ConfigItems, revision: impl Into<String>) -> Self {
        Self {
            items,
            revision: revision.into(),
        }
    }

    /// Decodes a full fetch response body.
    ///
    /// The body maps dimension names to item objects; the `revision` entry
    /// carries the token. Dimensions are merged in document order so later
    /// dimensions override earlier ones.
    pub fn from_items_response(body: &[u8]) -> Result<Self, SyncError> {
        let dimensions: Map<String, Value> = serde_json::from_slice(body)
            .map_err(|err| SyncError::decode(format!("items response: {err}")))?;

        let mut items = ConfigItems::new();
        let mut revision = String::new();
        for (dimension, value) in dimensions {
            let Value::Object(entries) = value else {
                return Err(SyncError::decode(format!(
                    "dimension `{dimension}` is not an object"
                )));
            };
            if dimension == REVISION_DIMENSION {
                revision = match entries.get(REVISION_VERSION_FIELD) {
                    Some(Value::String(token)) => token.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                };
                continue;
            }
            items.extend(entries);
        }
        Ok(Self { items, revision })
    }

    /// Returns the configuration items.
    pub fn items(&self) -> &ConfigItems {
        &self.items
    }

    /// Returns the opaque revision token (empty before the first fetch).
    pub fn revision(&self) -> &str {
        &self.revision
    }

    /// Looks up a single key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.items.get(key)
    }
}

/// Difference between two snapshots.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SnapshotChange {
    /// Keys present only in the new snapshot, with their values.
    pub created: ConfigItems,
    /// Keys present in both whose value changed, with their new values.
    pub updated: ConfigItems,
    /// Keys present only in the old snapshot.
    pub deleted: Vec<String>,
}

impl SnapshotChange {
    /// Computes the change turning `previous` into `next`.
    pub fn between(previous: &ConfigItems, next: &ConfigItems) -> Self {
        let mut change = Self::default();
        for (key, value) in next {
            match previous.get(key) {
                None => {
                    change.created.insert(key.clone(), value.clone());
                }
                Some(old) if old != value => {
                    change.updated.insert(key.clone(), value.clone());
                }
                Some(_) => {}
            }
        }
        change.deleted = previous
            .keys()
            .filter(|key| !next.contains_key(key.as_str()))
            .cloned()
            .collect();
        change
    }

    /// Returns `true` when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Receiver of configuration changes.
pub trait UpdateSink: Send + Sync {
    /// Called synchronously, once per non-empty change, before the apply returns.
    fn on_snapshot_changed(&self, change: &SnapshotChange);
}

/// Sink ignoring every change.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUpdateSink;

impl UpdateSink for NoopUpdateSink {
    fn on_snapshot_changed(&self, _change: &SnapshotChange) {}
}

/// Holder of the current snapshot.
pub struct SnapshotStore {
    current: RwLock<Arc<Snapshot>>,
    /// Serializes compute, swap and sink dispatch.
    apply_lock: Mutex<()>,
    sink: Arc<dyn UpdateSink>,
}

impl fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current = self.current();
        f.debug_struct("SnapshotStore")
            .field("revision", &current.revision())
            .field("items", &current.items().len())
            .finish()
    }
}

impl SnapshotStore {
    /// Creates an empty store notifying `sink` on change.
    pub fn new(sink: Arc<dyn UpdateSink>) -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::default())),
            apply_lock: Mutex::new(()),
            sink,
        }
    }

    /// Returns the current snapshot.
    pub fn current(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the current revision token.
    pub fn revision(&self) -> String {
        self.current().revision().to_owned()
    }

    /// Replaces the stored snapshot and notifies the sink when items changed.
    ///
    /// A snapshot carrying the stored revision is a no-op and yields an empty change.
    pub fn apply_full(&self, snapshot: Snapshot) -> SnapshotChange {
        let _guard = self.apply_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.current();
        if previous.revision() == snapshot.revision() && !snapshot.revision().is_empty() {
            debug!(
                revision = %snapshot.revision(),
                "config-center snapshot revision unchanged"
            );
            return SnapshotChange::default();
        }

        let change = SnapshotChange::between(previous.items(), snapshot.items());
        let revision = snapshot.revision().to_owned();
        self.swap(snapshot);
        debug!(
            revision = %revision,
            created = change.created.len(),
            updated = change.updated.len(),
            deleted = change.deleted.len(),
            "config-center snapshot applied"
        );
        if !change.is_empty() {
            self.sink.on_snapshot_changed(&change);
        }
        change
    }

    /// Applies a pushed single-change action without refetching.
    ///
    /// `payload` is the push frame; its `value` object lists the affected keys.
    /// Unsupported actions and malformed payloads leave the store untouched.
    pub fn apply_incremental(
        &self,
        action: &str,
        payload: &Value,
    ) -> Result<SnapshotChange, SyncError> {
        let Some(Value::Object(values)) = payload.get(INCREMENTAL_VALUE_FIELD) else {
            return Err(SyncError::decode(format!(
                "incremental `{action}` without a `value` object"
            )));
        };

        let _guard = self.apply_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.current();
        let mut items = previous.items().clone();
        match action {
            ACTION_UPDATE => {
                for (key, value) in values {
                    items.insert(key.clone(), value.clone());
                }
            }
            ACTION_DELETE => {
                for key in values.keys() {
                    items.shift_remove(key);
                }
            }
            other => {
                return Err(SyncError::decode(format!(
                    "unsupported incremental action `{other}`"
                )));
            }
        }

        let change = SnapshotChange::between(previous.items(), &items);
        if change.is_empty() {
            return Ok(change);
        }
        self.swap(Snapshot::new(items, previous.revision()));
        self.sink.on_snapshot_changed(&change);
        Ok(change)
    }

    fn swap(&self, snapshot: Snapshot) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(snapshot);
    }
}
