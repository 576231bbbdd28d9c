use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::trace;

use super::hooks::{Hook, HookIdentity, PromiseCore};
use super::ids::{ExportId, IdAllocator, ImportId};

/// Export table: ids we gave the peer, each owning one hook reference.
/// The wire refcount counts how many times the id was introduced.
pub struct ExportTable {
    allocator: Arc<IdAllocator>,
    entries: DashMap<ExportId, ExportEntry>,
    by_identity: DashMap<HookIdentity, ExportId>,
}

struct ExportEntry {
    hook: Hook,
    refcount: AtomicU32,
}

impl ExportTable {
    pub fn new(allocator: Arc<IdAllocator>) -> Self {
        Self {
            allocator,
            entries: DashMap::new(),
            by_identity: DashMap::new(),
        }
    }

    /// Install the bootstrap capability at id 0.
    pub fn insert_bootstrap(&self, hook: Hook) {
        self.by_identity.insert(hook.identity(), ExportId(0));
        self.entries.insert(
            ExportId(0),
            ExportEntry {
                hook,
                refcount: AtomicU32::new(1),
            },
        );
    }

    /// Record an entry for a peer-pushed id.
    pub fn insert_pushed(&self, id: ExportId, hook: Hook) -> Result<(), TableError> {
        if self.entries.contains_key(&id) {
            hook.dispose();
            return Err(TableError::DuplicateExport(id));
        }
        trace!(%id, "export pushed");
        self.entries.insert(
            id,
            ExportEntry {
                hook,
                refcount: AtomicU32::new(1),
            },
        );
        Ok(())
    }

    /// Export a hook, taking ownership. Returns the existing id when the
    /// same underlying resource is already exported.
    pub fn export(&self, hook: Hook) -> ExportId {
        let identity = hook.identity();
        if let Some(existing) = self.by_identity.get(&identity) {
            let id = *existing;
            drop(existing);
            if let Some(entry) = self.entries.get(&id) {
                entry.refcount.fetch_add(1, Ordering::SeqCst);
                drop(entry);
                // The table already owns a reference to this resource.
                hook.dispose();
                trace!(%id, "export deduplicated");
                return id;
            }
        }
        let id = self.allocator.allocate_export();
        self.by_identity.insert(identity, id);
        self.entries.insert(
            id,
            ExportEntry {
                hook,
                refcount: AtomicU32::new(1),
            },
        );
        trace!(%id, "export allocated");
        id
    }

    /// A dup'd handle on the exported hook.
    pub fn get(&self, id: ExportId) -> Option<Hook> {
        self.entries.get(&id).map(|entry| entry.hook.dup())
    }

    pub fn contains(&self, id: ExportId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Drop `refcount` references. Returns true when the entry was removed.
    pub fn release(&self, id: ExportId, refcount: u32) -> Result<bool, TableError> {
        if id.is_bootstrap() {
            return Err(TableError::BootstrapRelease);
        }
        let remove = {
            let entry = self.entries.get(&id).ok_or(TableError::UnknownExport(id))?;
            let current = entry.refcount.load(Ordering::SeqCst);
            if refcount > current {
                return Err(TableError::RefcountUnderflow(id));
            }
            let remaining = current - refcount;
            entry.refcount.store(remaining, Ordering::SeqCst);
            trace!(%id, remaining, "export released");
            remaining == 0
        };
        if remove {
            if let Some((_, entry)) = self.entries.remove(&id) {
                self.by_identity.remove(&entry.hook.identity());
                entry.hook.dispose();
            }
        }
        Ok(remove)
    }

    /// Tear down every entry, disposing the hooks.
    pub fn drain(&self) {
        self.by_identity.clear();
        let ids: Vec<ExportId> = self.entries.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                entry.hook.dispose();
            }
        }
    }
}

impl std::fmt::Debug for ExportTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportTable")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// What a local release of an import requires of the session.
#[derive(Debug, PartialEq, Eq)]
pub struct PendingRelease {
    /// Send `["release", id, n]` for this many wire references.
    pub send: Option<u32>,
    /// The entry is gone; nothing further will arrive for it.
    pub removed: bool,
}

/// Import table: ids we hold from the peer. Local dups are tracked apart
/// from wire introductions so a single release frame carries the total.
pub struct ImportTable {
    entries: DashMap<ImportId, ImportEntry>,
}

struct ImportEntry {
    slot: Arc<PromiseCore>,
    local_refs: AtomicU32,
    remote_refs: AtomicU32,
    pulled: AtomicBool,
    /// Imported settled capability (introduced by `["export", id]`) rather
    /// than a pending push result.
    settled_stub: AtomicBool,
}

impl ImportTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Create the slot for a locally-pushed id.
    pub fn insert_pushed(&self, id: ImportId) -> Arc<PromiseCore> {
        let slot = PromiseCore::new();
        self.entries.insert(
            id,
            ImportEntry {
                slot: slot.clone(),
                local_refs: AtomicU32::new(1),
                remote_refs: AtomicU32::new(1),
                pulled: AtomicBool::new(false),
                settled_stub: AtomicBool::new(false),
            },
        );
        trace!(%id, "import pushed");
        slot
    }

    /// Record a peer introduction of a settled capability. Creates the
    /// entry on first sight; later introductions add one local and one
    /// remote reference.
    pub fn import_introduced(&self, id: ImportId) {
        match self.entries.get(&id) {
            Some(entry) => {
                entry.local_refs.fetch_add(1, Ordering::SeqCst);
                entry.remote_refs.fetch_add(1, Ordering::SeqCst);
            }
            None => {
                self.entries.insert(
                    id,
                    ImportEntry {
                        slot: PromiseCore::new(),
                        local_refs: AtomicU32::new(1),
                        remote_refs: AtomicU32::new(1),
                        pulled: AtomicBool::new(false),
                        settled_stub: AtomicBool::new(true),
                    },
                );
                trace!(%id, "import introduced");
            }
        }
    }

    /// Install the bootstrap import at id 0. Never released over the wire.
    pub fn insert_bootstrap(&self) {
        self.entries.insert(
            ImportId(0),
            ImportEntry {
                slot: PromiseCore::new(),
                local_refs: AtomicU32::new(1),
                remote_refs: AtomicU32::new(0),
                pulled: AtomicBool::new(false),
                settled_stub: AtomicBool::new(true),
            },
        );
    }

    pub fn contains(&self, id: ImportId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn slot(&self, id: ImportId) -> Option<Arc<PromiseCore>> {
        self.entries.get(&id).map(|entry| entry.slot.clone())
    }

    pub fn is_settled_stub(&self, id: ImportId) -> bool {
        self.entries
            .get(&id)
            .map(|entry| entry.settled_stub.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// First pull wins; later pulls reuse the in-flight request.
    pub fn mark_pulled(&self, id: ImportId) -> bool {
        self.entries
            .get(&id)
            .map(|entry| !entry.pulled.swap(true, Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn add_local_ref(&self, id: ImportId) {
        if let Some(entry) = self.entries.get(&id) {
            entry.local_refs.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Drop one local reference. When the last local reference goes, the
    /// accumulated wire references are surrendered in one release frame.
    /// Unsettled entries stay as tombstones so a late resolve lands as
    /// garbage instead of a protocol error.
    pub fn release_local(&self, id: ImportId) -> PendingRelease {
        let (send, removable, slot) = {
            let Some(entry) = self.entries.get(&id) else {
                return PendingRelease {
                    send: None,
                    removed: false,
                };
            };
            let prev = entry.local_refs.fetch_sub(1, Ordering::SeqCst);
            if prev == 0 {
                entry.local_refs.store(0, Ordering::SeqCst);
                debug_assert!(false, "import refcount underflow");
                return PendingRelease {
                    send: None,
                    removed: false,
                };
            }
            if prev > 1 {
                return PendingRelease {
                    send: None,
                    removed: false,
                };
            }
            if id.is_bootstrap() {
                // The bootstrap entry persists for the session's lifetime.
                return PendingRelease {
                    send: None,
                    removed: false,
                };
            }
            let wire = entry.remote_refs.swap(0, Ordering::SeqCst);
            let settled =
                entry.settled_stub.load(Ordering::SeqCst) || entry.slot.is_settled();
            let pulled = entry.pulled.load(Ordering::SeqCst);
            // A pull in flight means one wire reference is already spoken
            // for: the peer surrenders it when it resolves. Releasing it
            // here too would cross the resolution on the wire.
            let reserve = if pulled && !settled { 1 } else { 0 };
            if reserve > 0 {
                entry.remote_refs.store(reserve, Ordering::SeqCst);
            }
            let to_send = wire.saturating_sub(reserve);
            let send = if to_send > 0 { Some(to_send) } else { None };
            // Without a pull there is nothing left to arrive; with one, the
            // entry lingers so the resolution lands as garbage.
            let removable = settled || !pulled;
            (send, removable, entry.slot.clone())
        };
        // The entry's interest in the slot ends with the last local ref;
        // a late resolve then lands as garbage inside the slot itself.
        slot.release_ref();
        if removable {
            self.entries.remove(&id);
        }
        trace!(%id, ?send, removed = removable, "import released locally");
        PendingRelease {
            send,
            removed: removable,
        }
    }

    /// One wire reference is consumed by a resolution. Removes the entry
    /// when no local references remain (the cancellation tombstone case).
    pub fn consume_remote_on_settle(&self, id: ImportId) {
        let remove = {
            let Some(entry) = self.entries.get(&id) else {
                return;
            };
            let remote = entry.remote_refs.load(Ordering::SeqCst);
            if remote > 0 {
                entry.remote_refs.store(remote - 1, Ordering::SeqCst);
            }
            entry.local_refs.load(Ordering::SeqCst) == 0
        };
        if remove {
            self.entries.remove(&id);
        }
    }

    /// Tear down: every live slot is handed back for rejection.
    pub fn drain(&self) -> Vec<(ImportId, Arc<PromiseCore>)> {
        let ids: Vec<ImportId> = self.entries.iter().map(|e| *e.key()).collect();
        let mut slots = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                slots.push((id, entry.slot));
            }
        }
        slots
    }

    /// Total local references for an id, for diagnostics and tests.
    pub fn local_refs(&self, id: ImportId) -> u32 {
        self.entries
            .get(&id)
            .map(|entry| entry.local_refs.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

impl Default for ImportTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ImportTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportTable")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("Duplicate export ID: {0}")]
    DuplicateExport(ExportId),

    #[error("Unknown export ID: {0}")]
    UnknownExport(ExportId),

    #[error("Unknown import ID: {0}")]
    UnknownImport(ImportId),

    #[error("Refcount underflow on {0}")]
    RefcountUnderflow(ExportId),

    #[error("The bootstrap export cannot be released")]
    BootstrapRelease,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::payload::Value;
    use std::sync::Arc;

    fn value_hook(n: i64) -> Hook {
        Hook::for_value(Value::from(n))
    }

    #[test]
    fn test_export_dedup_by_identity() {
        let table = ExportTable::new(Arc::new(IdAllocator::new()));
        let hook = value_hook(1);
        let twin = hook.dup();
        let id1 = table.export(hook);
        let id2 = table.export(twin);
        assert_eq!(id1, id2);

        // An independent hook over equal data gets a fresh id.
        let id3 = table.export(value_hook(1));
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_export_release_semantics() {
        let table = ExportTable::new(Arc::new(IdAllocator::new()));
        let hook = value_hook(7);
        let twin = hook.dup();
        let id = table.export(hook);
        assert_eq!(table.export(twin), id); // refcount now 2

        assert!(!table.release(id, 1).unwrap());
        assert!(table.release(id, 1).unwrap());
        assert!(table.get(id).is_none());
    }

    #[test]
    fn test_export_release_underflow() {
        let table = ExportTable::new(Arc::new(IdAllocator::new()));
        let id = table.export(value_hook(1));
        assert!(matches!(
            table.release(id, 2),
            Err(TableError::RefcountUnderflow(_))
        ));
    }

    #[test]
    fn test_bootstrap_cannot_be_released() {
        let table = ExportTable::new(Arc::new(IdAllocator::new()));
        table.insert_bootstrap(value_hook(0));
        assert!(matches!(
            table.release(ExportId(0), 1),
            Err(TableError::BootstrapRelease)
        ));
    }

    #[test]
    fn test_duplicate_pushed_export() {
        let table = ExportTable::new(Arc::new(IdAllocator::new()));
        table.insert_pushed(ExportId(1), value_hook(1)).unwrap();
        assert!(matches!(
            table.insert_pushed(ExportId(1), value_hook(2)),
            Err(TableError::DuplicateExport(_))
        ));
    }

    #[test]
    fn test_import_local_release_aggregates_wire_refs() {
        let table = ImportTable::new();
        let id = ImportId(-1);
        table.import_introduced(id); // local 1, remote 1
        table.import_introduced(id); // local 2, remote 2
        table.add_local_ref(id); // local 3

        assert_eq!(
            table.release_local(id),
            PendingRelease {
                send: None,
                removed: false
            }
        );
        assert_eq!(
            table.release_local(id),
            PendingRelease {
                send: None,
                removed: false
            }
        );
        // Last local reference: surrender both wire references at once.
        assert_eq!(
            table.release_local(id),
            PendingRelease {
                send: Some(2),
                removed: true
            }
        );
        assert!(!table.contains(id));
    }

    #[test]
    fn test_unpulled_import_releases_immediately() {
        let table = ImportTable::new();
        let id = ImportId(1);
        table.insert_pushed(id);
        // Nothing was pulled, so no resolution will arrive: the wire
        // reference is surrendered and the entry goes away.
        let release = table.release_local(id);
        assert_eq!(release.send, Some(1));
        assert!(release.removed);
        assert!(!table.contains(id));
    }

    #[test]
    fn test_pulled_import_leaves_resolution_to_the_peer() {
        let table = ImportTable::new();
        let id = ImportId(1);
        let slot = table.insert_pushed(id);
        assert!(table.mark_pulled(id));
        // Disposed with the pull in flight: the wire reference is spoken
        // for by the resolution, so no release frame goes out and the
        // entry lingers as a tombstone.
        let release = table.release_local(id);
        assert_eq!(release.send, None);
        assert!(!release.removed);
        assert!(table.contains(id));

        // The late resolve lands as garbage and clears the tombstone.
        slot.resolve(crate::protocol::payload::Payload::null());
        table.consume_remote_on_settle(id);
        assert!(!table.contains(id));
    }

    #[test]
    fn test_mark_pulled_is_once() {
        let table = ImportTable::new();
        let id = ImportId(1);
        table.insert_pushed(id);
        assert!(table.mark_pulled(id));
        assert!(!table.mark_pulled(id));
    }
}
