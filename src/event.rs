// SPDX-License-Identifier: MIT

//! The observed memory-access event and the trace-line parser
//!
//! One trace line per event, tab-separated:
//!
//! ```text
//! timestamp \t thread \t task \t vclock \t kind \t memory_id \t [kind fields...] \t caller \t offset
//! ```
//!
//! Events are built at the observation boundary and immutable afterwards.
//! Malformed lines parse to `None`; the ingest loops drop them and move on.

use crate::types::{
    AccessKind, StaticSite, ValueId, DISPOSE_SUFFIX, LOCK_ENTER_CALLEE, LOCK_EXIT_CALLEE,
};
use std::collections::HashMap;

/// Trace-line record names, as written by the engine's callbacks.
pub const BEFORE_FIELD_READ: &str = "BeforeFieldRead";
pub const BEFORE_FIELD_WRITE: &str = "BeforeFieldWrite";
pub const AFTER_FIELD_WRITE: &str = "AfterFieldWrite";
pub const BEFORE_METHOD_CALL: &str = "BeforeMethodCall";
pub const AFTER_METHOD_CALL: &str = "AfterMethodCall";
pub const DELAY_INJECTION: &str = "DelayInjection";

/// One observed field access, method use or disposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryAccessEvent {
    /// `object@field` identity of the accessed location; empty for statics.
    pub memory_id: String,
    pub kind: AccessKind,
    /// Value before the access (equals `new_value` for reads).
    pub old_value: ValueId,
    /// Value after the access.
    pub new_value: ValueId,
    /// Monotonic 100 ns ticks.
    pub timestamp: u64,
    pub thread_id: u32,
    pub task_id: u64,
    /// Logical clock snapshot of the accessing context.
    pub vector_clock: String,
    /// Static location performing the access.
    pub site: StaticSite,
    /// Monitor nesting depth of the accessing thread at this point.
    pub lock_depth: i32,
    /// Access counter for this memory id, assigned at ingest.
    pub per_object_seq: u64,
    /// Access counter for this static site, assigned at ingest.
    pub global_seq: u64,
}

impl MemoryAccessEvent {
    pub fn field_name(&self) -> &str {
        crate::types::field_name_of(&self.memory_id)
    }

    /// Construction-like write: null before, non-null after.
    pub fn is_init_write(&self) -> bool {
        self.kind == AccessKind::Write && self.old_value.is_null() && !self.new_value.is_null()
    }

    /// Teardown-like write: non-null before, null after.
    pub fn is_teardown_write(&self) -> bool {
        self.kind == AccessKind::Write && !self.old_value.is_null() && self.new_value.is_null()
    }
}

/// Streaming parser for trace lines.
///
/// Holds the per-thread monitor depth that `Lock` records update, so lines
/// must be fed in file order.
#[derive(Debug, Default)]
pub struct TraceLineParser {
    lock_depth: HashMap<u32, i32>,
}

impl TraceLineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one trace line into an event, or `None` for malformed input
    /// and for record kinds that are not memory accesses.
    pub fn parse_line(&mut self, line: &str) -> Option<MemoryAccessEvent> {
        let tokens: Vec<&str> = line.split('\t').collect();
        if tokens.len() < 5 {
            return None;
        }

        let timestamp: u64 = tokens[0].parse().ok()?;
        let thread_id: u32 = tokens[1].parse().ok()?;
        let task_id: u64 = tokens[2].parse().ok()?;
        let vector_clock = tokens[3].to_string();
        let depth = *self.lock_depth.entry(thread_id).or_insert(0);

        let mut event = MemoryAccessEvent {
            memory_id: String::new(),
            kind: AccessKind::None,
            old_value: ValueId::NULL,
            new_value: ValueId::NULL,
            timestamp,
            thread_id,
            task_id,
            vector_clock,
            site: StaticSite::new("", 0),
            lock_depth: depth,
            per_object_seq: 0,
            global_seq: 0,
        };

        match tokens[4] {
            BEFORE_FIELD_READ => {
                // kind fields: memory_id, value
                event.kind = AccessKind::Read;
                event.memory_id = tokens.get(5)?.to_string();
                event.old_value = tokens.get(6)?.parse().ok()?;
                event.new_value = event.old_value;
                event.site = site_from(&tokens, 7)?;
            }
            BEFORE_FIELD_WRITE => {
                // kind fields: memory_id, old value, new value
                event.kind = AccessKind::Write;
                event.memory_id = tokens.get(5)?.to_string();
                event.old_value = tokens.get(6)?.parse().ok()?;
                event.new_value = tokens.get(7)?.parse().ok()?;
                event.site = site_from(&tokens, 8)?;
            }
            AFTER_FIELD_WRITE => {
                // kind fields: memory_id, value now held
                event.kind = AccessKind::Write;
                event.memory_id = tokens.get(5)?.to_string();
                event.old_value = tokens.get(6)?.parse().ok()?;
                event.new_value = event.old_value;
                event.site = site_from(&tokens, 7)?;
            }
            BEFORE_METHOD_CALL => {
                // kind fields: memory_id, callee
                event.memory_id = tokens.get(5)?.to_string();
                let callee = *tokens.get(6)?;
                event.site = site_from(&tokens, 7)?;
                event.kind = match callee {
                    LOCK_ENTER_CALLEE => {
                        *self.lock_depth.entry(thread_id).or_insert(0) += 1;
                        AccessKind::Lock
                    }
                    LOCK_EXIT_CALLEE => {
                        *self.lock_depth.entry(thread_id).or_insert(0) -= 1;
                        AccessKind::Lock
                    }
                    _ => AccessKind::Use,
                };
            }
            AFTER_METHOD_CALL => {
                // kind fields: memory_id, callee, then caller/offset/instance
                event.memory_id = tokens.get(5)?.to_string();
                let callee = *tokens.get(6)?;
                event.site = site_from(&tokens, 7)?;
                if let Some(instance) = tokens.get(9) {
                    event.old_value = instance.parse().ok()?;
                }
                event.kind = if callee.ends_with(DISPOSE_SUFFIX) {
                    AccessKind::Dispose
                } else {
                    AccessKind::None
                };
            }
            _ => return None,
        }

        Some(event)
    }
}

fn site_from(tokens: &[&str], caller_idx: usize) -> Option<StaticSite> {
    let caller = *tokens.get(caller_idx)?;
    let offset: u32 = tokens.get(caller_idx + 1)?.parse().ok()?;
    Some(StaticSite::new(caller, offset))
}
