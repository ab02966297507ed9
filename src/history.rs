// SPDX-License-Identifier: MIT

//! Per-object access history and the candidate-race detector
//!
//! The detector walks one memory id's ordered event buffer looking for two
//! near-miss patterns: a construction-like write followed too closely by a
//! use from another thread (use-before-init), and a teardown-like write or
//! disposal preceded too closely by a read/use from another thread
//! (use-after-free). A pair that matches the temporal pattern but is
//! happens-before related is suppressed; suppression is the only admitted
//! way to reject a structural match.
//!
//! The history is single-writer: whoever owns it (the offline analyzer or a
//! callback dispatcher holding the per-object lock) serializes `push` and
//! `potential_races`.

use crate::event::MemoryAccessEvent;
use crate::types::{gap_ms, AccessKind, ReadType, StaticSite, WriteType};
use crate::vclock;
use std::collections::HashSet;
use std::sync::Arc;

/// Reads from this caller are diagnostic taps worth reporting even though
/// plain reads are otherwise ignored by the use-before-init scan.
const DIAGNOSTIC_READ_FRAGMENT: &str = "DiagnosticsEventListener::OnEventWritten";

/// A candidate race: a write-or-dispose event paired with a read-or-use
/// event on the same memory id.
#[derive(Debug, Clone)]
pub struct RacyAccess {
    pub read: Arc<MemoryAccessEvent>,
    pub read_type: ReadType,
    pub write: Arc<MemoryAccessEvent>,
    pub write_type: WriteType,
    /// Gap between the two accesses, rounded up to whole milliseconds.
    pub gap_ms: u64,
}

impl RacyAccess {
    pub fn new(
        read: Arc<MemoryAccessEvent>,
        read_type: ReadType,
        write: Arc<MemoryAccessEvent>,
        write_type: WriteType,
    ) -> Self {
        let gap = gap_ms(read.timestamp, write.timestamp);
        Self {
            read,
            read_type,
            write,
            write_type,
            gap_ms: gap,
        }
    }

    /// Deduplication identity: the (write site, read site) pair.
    pub fn pair_key(&self) -> String {
        format!("{}!{}", self.write.site, self.read.site)
    }

    /// The static site where a delay would be injected to provoke this race:
    /// the write site for use-before-init, the read site otherwise.
    pub fn injection_site(&self) -> &StaticSite {
        match self.write_type {
            WriteType::NullToNonNull => &self.write.site,
            _ => &self.read.site,
        }
    }

    /// Both halves inside compiler-generated async continuations; such pairs
    /// are sequential continuation code, not concurrency.
    pub fn is_continuation_pair(&self) -> bool {
        self.write
            .site
            .caller
            .contains(crate::types::CONTINUATION_FRAGMENT)
            && self
                .read
                .site
                .caller
                .contains(crate::types::CONTINUATION_FRAGMENT)
    }
}

/// Ordered event buffer plus derived thread sets for one memory id.
#[derive(Debug, Default)]
pub struct MemoryAccessHistory {
    memory_id: String,
    events: Vec<Arc<MemoryAccessEvent>>,
    accessed_by: HashSet<u32>,
    read_by: HashSet<u32>,
    written_by: HashSet<u32>,
    /// Set when a scan saw a structurally matching pair that was rejected
    /// only because of a happens-before relation.
    pub has_hb_conflicts: bool,
}

impl MemoryAccessHistory {
    pub fn new(memory_id: impl Into<String>) -> Self {
        Self {
            memory_id: memory_id.into(),
            ..Self::default()
        }
    }

    pub fn memory_id(&self) -> &str {
        &self.memory_id
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Appends an event. Events must arrive in non-decreasing timestamp
    /// order as observed by the ingesting thread.
    pub fn push(&mut self, event: Arc<MemoryAccessEvent>) {
        self.accessed_by.insert(event.thread_id);
        if event.kind.is_read_like() {
            self.read_by.insert(event.thread_id);
        } else if event.kind.is_write_like() {
            self.written_by.insert(event.thread_id);
        }
        self.events.push(event);
    }

    /// Cheap screen: a memory id written and read by disjoint thread
    /// populations is worth a full scan.
    pub fn is_potential_race(&self) -> bool {
        self.accessed_by.len() != self.written_by.len()
    }

    /// Runs the three pattern scans and returns every candidate race.
    ///
    /// With `check_hb` false the happens-before filter is disabled, which
    /// also leaves `has_hb_conflicts` untouched.
    pub fn potential_races(&mut self, near_miss_ms: u64, check_hb: bool) -> Vec<RacyAccess> {
        let mut races = Vec::new();

        self.scan_init_writes(near_miss_ms, check_hb, &mut races);
        self.scan_backward(
            near_miss_ms,
            check_hb,
            |e| e.is_teardown_write(),
            WriteType::NonNullToNull,
            &mut races,
        );
        self.scan_backward(
            near_miss_ms,
            check_hb,
            |e| e.kind == AccessKind::Dispose,
            WriteType::Dispose,
            &mut races,
        );

        races
    }

    fn related(&mut self, check_hb: bool, a: &MemoryAccessEvent, b: &MemoryAccessEvent) -> bool {
        if !check_hb {
            return false;
        }
        if vclock::is_ancestor(&a.vector_clock, &b.vector_clock) {
            self.has_hb_conflicts = true;
            return true;
        }
        false
    }

    /// Forward scan from every construction-like write: a use (or a
    /// special-cased diagnostic read) from another thread inside the window
    /// is a use-before-init candidate. A later overwrite with a non-null
    /// value resolves the conflict and ends the scan.
    fn scan_init_writes(&mut self, near_miss_ms: u64, check_hb: bool, races: &mut Vec<RacyAccess>) {
        let init_writes: Vec<usize> = (0..self.events.len())
            .filter(|&i| self.events[i].is_init_write())
            .collect();

        for write_idx in init_writes {
            let write = Arc::clone(&self.events[write_idx]);
            for idx in write_idx + 1..self.events.len() {
                let access = Arc::clone(&self.events[idx]);
                if gap_ms(write.timestamp, access.timestamp) > near_miss_ms {
                    break;
                }

                let other_context = access.thread_id != write.thread_id
                    || access.task_id != write.task_id;
                if other_context && !self.related(check_hb, &write, &access) {
                    if access.kind == AccessKind::Write && !access.new_value.is_null() {
                        break;
                    }

                    if access.kind == AccessKind::Use
                        || (access.kind == AccessKind::Read
                            && access.site.caller.contains(DIAGNOSTIC_READ_FRAGMENT))
                    {
                        races.push(RacyAccess::new(
                            access,
                            ReadType::Use,
                            Arc::clone(&write),
                            WriteType::NullToNonNull,
                        ));
                    }
                }
            }
        }
    }

    /// Backward scan from every teardown-like write (or dispose): a prior
    /// read/use from another thread inside the window is a use-after-free
    /// candidate, at most one per distinct prior thread.
    fn scan_backward(
        &mut self,
        near_miss_ms: u64,
        check_hb: bool,
        select: impl Fn(&MemoryAccessEvent) -> bool,
        write_type: WriteType,
        races: &mut Vec<RacyAccess>,
    ) {
        let writes: Vec<usize> = (0..self.events.len())
            .filter(|&i| select(&self.events[i]))
            .collect();

        let mut seen_threads: HashSet<u32> = HashSet::new();
        for write_idx in writes {
            let write = Arc::clone(&self.events[write_idx]);
            for idx in (0..write_idx).rev() {
                let access = Arc::clone(&self.events[idx]);
                if gap_ms(write.timestamp, access.timestamp) > near_miss_ms {
                    break;
                }

                let other_context = access.thread_id != write.thread_id
                    || access.task_id != write.task_id;
                if other_context
                    && !self.related(check_hb, &write, &access)
                    && access.kind.is_read_like()
                    && seen_threads.insert(access.thread_id)
                {
                    let read_type = if access.kind == AccessKind::Read {
                        ReadType::Read
                    } else {
                        ReadType::Use
                    };
                    races.push(RacyAccess::new(access, read_type, Arc::clone(&write), write_type));
                }
            }
        }
    }
}
