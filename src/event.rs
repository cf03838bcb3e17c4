// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::doc::DocId;
use std::sync::Arc;

/// A free-form database event, broadcast to the configured listener
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DbEvent {
    /// The update seq advanced.
    Updated {
        /// Database name (file stem).
        name: String,
    },

    /// A design document was written.
    DdocUpdated {
        /// Database name (file stem).
        name: String,

        /// Id of the design document.
        id: DocId,
    },

    /// A compaction hand-off completed.
    Compacted {
        /// Database name (file stem).
        name: String,
    },
}

/// Callback receiving [`DbEvent`]s
///
/// Invoked from the updater thread; keep it cheap.
pub type EventListener = Arc<dyn Fn(&DbEvent) + Send + Sync>;
