use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Import ID - an entry in the import table (ids we hold from the peer).
/// Positive IDs (1, 2, 3...) are chosen by the importing side when pushing.
/// Negative IDs (-1, -2, -3...) arrive from the peer's exporter.
/// ID 0 is reserved for the bootstrap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImportId(pub i64);

impl ImportId {
    pub fn bootstrap() -> Self {
        ImportId(0)
    }

    pub fn is_bootstrap(&self) -> bool {
        self.0 == 0
    }

    /// Whether this ID was allocated locally (pushed by us).
    pub fn is_local(&self) -> bool {
        self.0 > 0
    }

    /// The matching key in the peer's export table.
    pub fn to_export_id(&self) -> ExportId {
        ExportId(self.0)
    }
}

impl fmt::Display for ImportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Import#{}", self.0)
    }
}

/// Export ID - an entry in the export table (ids we gave the peer).
/// Positive IDs are chosen by the pushing peer; negative IDs are allocated
/// locally when the codec exports a hook. ID 0 is the bootstrap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExportId(pub i64);

impl ExportId {
    pub fn bootstrap() -> Self {
        ExportId(0)
    }

    pub fn is_bootstrap(&self) -> bool {
        self.0 == 0
    }

    /// Whether this ID was allocated locally (negative).
    pub fn is_local(&self) -> bool {
        self.0 < 0
    }

    /// The matching key in the peer's import table.
    pub fn to_import_id(&self) -> ImportId {
        ImportId(self.0)
    }
}

impl fmt::Display for ExportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Export#{}", self.0)
    }
}

/// Allocator for locally-chosen ids. Monotonic; ids are never reused while
/// the session lives.
#[derive(Debug)]
pub struct IdAllocator {
    next_import: AtomicI64,
    next_export: AtomicI64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next_import: AtomicI64::new(1),
            next_export: AtomicI64::new(-1),
        }
    }

    /// Allocate a new local import ID (positive) for a push.
    pub fn allocate_import(&self) -> ImportId {
        let id = self.next_import.fetch_add(1, Ordering::SeqCst);
        ImportId(id)
    }

    /// Allocate a new local export ID (negative) for an exported hook.
    pub fn allocate_export(&self) -> ExportId {
        let id = self.next_export.fetch_sub(1, Ordering::SeqCst);
        ExportId(id)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
