// SPDX-License-Identifier: MIT

//! Batch driver over a recorded trace: ingest, race scan, pruning

use crate::event::{MemoryAccessEvent, TraceLineParser};
use crate::history::{MemoryAccessHistory, RacyAccess};
use crate::types::{field_name_of, StaticSite, WriteType, STATIC_INIT_FRAGMENT};
use anyhow::{Context, Result};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

/// Offline trace analyzer: builds one [`MemoryAccessHistory`] per memory id
/// and aggregates candidate races across all of them.
pub struct TraceAnalyzer {
    /// Every retained event in arrival order.
    trace: Vec<Arc<MemoryAccessEvent>>,
    histories: HashMap<String, MemoryAccessHistory>,
    /// Candidate races accumulated by [`compute_racy_pairs`].
    pub races: Vec<RacyAccess>,
}

impl TraceAnalyzer {
    /// Ingests a trace log. Malformed lines, static-initializer callers and
    /// events without a memory id are dropped, never fatal.
    pub fn from_log(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("cannot open trace log {}", path.display()))?;

        let mut analyzer = Self {
            trace: Vec::new(),
            histories: HashMap::new(),
            races: Vec::new(),
        };

        let mut parser = TraceLineParser::new();
        let mut per_object: HashMap<String, u64> = HashMap::new();
        let mut per_site: HashMap<String, u64> = HashMap::new();

        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            let Some(mut event) = parser.parse_line(&line) else {
                continue;
            };

            if event.memory_id.is_empty() {
                continue;
            }
            // one-time static setup noise
            if event.site.caller.contains(STATIC_INIT_FRAGMENT) {
                continue;
            }

            let object_seq = per_object.entry(event.memory_id.clone()).or_insert(0);
            *object_seq += 1;
            event.per_object_seq = *object_seq;
            let site_seq = per_site.entry(event.site.to_string()).or_insert(0);
            *site_seq += 1;
            event.global_seq = *site_seq;

            let event = Arc::new(event);
            analyzer
                .histories
                .entry(event.memory_id.clone())
                .or_insert_with(|| MemoryAccessHistory::new(&event.memory_id))
                .push(Arc::clone(&event));
            analyzer.trace.push(event);
        }

        Ok(analyzer)
    }

    pub fn trace(&self) -> &[Arc<MemoryAccessEvent>] {
        &self.trace
    }

    /// Fields whose thread populations suggest a race, cheapest screen
    /// first. Distinct objects sharing a field collapse to one entry.
    pub fn racy_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = self
            .histories
            .values()
            .filter(|h| h.is_potential_race())
            .map(|h| field_name_of(h.memory_id()))
            .collect();
        fields.sort_unstable();
        fields.dedup();
        fields
    }

    /// Scans every history for candidate races, in parallel across memory
    /// ids.
    pub fn compute_racy_pairs(&mut self, near_miss_ms: u64, check_hb: bool) {
        self.races = self
            .histories
            .par_iter_mut()
            .flat_map_iter(|(_, history)| history.potential_races(near_miss_ms, check_hb))
            .collect();
    }

    /// Drops candidates whose gap exceeds the window and pairs living
    /// entirely inside compiler-generated continuations.
    pub fn prune_large_gaps(&mut self, max_gap_ms: u64) {
        self.races
            .retain(|race| race.gap_ms <= max_gap_ms && !race.is_continuation_pair());
    }

    /// Collapses dynamic instances sharing a (write site, read site) key,
    /// keeping the instance with the largest gap. Idempotent.
    pub fn prune_duplicates_keep_largest_gap(&mut self) {
        Self::dedup_by_key(&mut self.races, |race| race.pair_key());
    }

    /// Collapses candidates sharing an injection site, keeping the largest
    /// gap. Used when one delay per site is all the budget allows.
    pub fn prune_duplicate_injection_points(&mut self) {
        Self::dedup_by_key(&mut self.races, |race| race.injection_site().to_string());
    }

    fn dedup_by_key(races: &mut Vec<RacyAccess>, key_of: impl Fn(&RacyAccess) -> String) {
        let mut largest: HashMap<String, u64> = HashMap::new();
        for race in races.iter() {
            let entry = largest.entry(key_of(race)).or_insert(race.gap_ms);
            *entry = (*entry).max(race.gap_ms);
        }

        races.retain(|race| {
            let key = key_of(race);
            match largest.get(&key) {
                Some(&gap) if gap == race.gap_ms => {
                    // keep only the first instance hitting the max gap
                    largest.remove(&key);
                    true
                }
                _ => false,
            }
        });
    }

    /// All static sites a delay plan would target, one per surviving race.
    pub fn injection_sites(&self) -> Vec<StaticSite> {
        let mut sites: Vec<StaticSite> = self
            .races
            .iter()
            .map(|race| race.injection_site().clone())
            .collect();
        sites.sort_unstable_by(|a, b| (a.to_string()).cmp(&b.to_string()));
        sites.dedup();
        sites
    }

    /// Count of surviving candidates per write type, for summaries.
    pub fn count_by_write_type(&self) -> HashMap<WriteType, usize> {
        let mut counts = HashMap::new();
        for race in &self.races {
            *counts.entry(race.write_type).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ReadType, TICKS_PER_MS};
    use std::io::Write as _;

    fn write_trace(lines: &[String]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    fn write_line(ts_ms: u64, thread: u32, mem: &str, old: &str, new: &str, caller: &str) -> String {
        format!(
            "{}\t{}\t0\t{}\tBeforeFieldWrite\t{}\t{}\t{}\t{}\t1",
            ts_ms * TICKS_PER_MS,
            thread,
            thread,
            mem,
            old,
            new,
            caller
        )
    }

    fn use_line(ts_ms: u64, thread: u32, mem: &str, caller: &str) -> String {
        format!(
            "{}\t{}\t0\t{}\tBeforeMethodCall\t{}\tConn::Send\t{}\t4",
            ts_ms * TICKS_PER_MS,
            thread,
            thread,
            mem,
            caller
        )
    }

    #[test]
    fn ingest_skips_garbage_and_static_initializers() {
        let file = write_trace(&[
            "garbage line".into(),
            write_line(0, 1, "a1@Svc::conn", "0", "ff", "Svc::.cctor"),
            write_line(1, 1, "a1@Svc::conn", "0", "ff", "Svc::Init"),
        ]);
        let analyzer = TraceAnalyzer::from_log(file.path()).unwrap();
        assert_eq!(analyzer.trace().len(), 1);
    }

    #[test]
    fn end_to_end_detects_use_before_init() {
        let file = write_trace(&[
            write_line(0, 1, "a1@Svc::conn", "0", "ff", "Svc::Init"),
            use_line(5, 2, "a1@Svc::conn", "Svc::Run"),
        ]);
        let mut analyzer = TraceAnalyzer::from_log(file.path()).unwrap();
        analyzer.compute_racy_pairs(100, true);
        assert_eq!(analyzer.races.len(), 1);
        assert_eq!(analyzer.races[0].write_type, WriteType::NullToNonNull);
        assert_eq!(analyzer.races[0].read_type, ReadType::Use);
    }

    #[test]
    fn continuation_pairs_are_pruned_even_when_timing_matches() {
        let file = write_trace(&[
            write_line(0, 1, "a1@Svc::conn", "0", "ff", "Svc+<Run>d__1::MoveNext"),
            use_line(5, 2, "a1@Svc::conn", "Svc+<Stop>d__2::MoveNext"),
        ]);
        let mut analyzer = TraceAnalyzer::from_log(file.path()).unwrap();
        analyzer.compute_racy_pairs(100, true);
        assert_eq!(analyzer.races.len(), 1);
        analyzer.prune_large_gaps(100);
        assert!(analyzer.races.is_empty());
    }

    #[test]
    fn dedup_keeps_largest_gap_and_is_idempotent() {
        let file = write_trace(&[
            write_line(0, 1, "a1@Svc::conn", "0", "ff", "Svc::Init"),
            use_line(5, 2, "a1@Svc::conn", "Svc::Run"),
            write_line(100, 1, "b2@Svc::conn", "0", "ff", "Svc::Init"),
            use_line(112, 2, "b2@Svc::conn", "Svc::Run"),
        ]);
        let mut analyzer = TraceAnalyzer::from_log(file.path()).unwrap();
        analyzer.compute_racy_pairs(100, true);
        assert_eq!(analyzer.races.len(), 2);

        analyzer.prune_duplicates_keep_largest_gap();
        assert_eq!(analyzer.races.len(), 1);
        assert_eq!(analyzer.races[0].gap_ms, 12);

        analyzer.prune_duplicates_keep_largest_gap();
        assert_eq!(analyzer.races.len(), 1);
        assert_eq!(analyzer.races[0].gap_ms, 12);
    }

    #[test]
    fn injection_point_dedup_collapses_sites() {
        let file = write_trace(&[
            write_line(0, 1, "a1@Svc::conn", "0", "ff", "Svc::Init"),
            use_line(5, 2, "a1@Svc::conn", "Svc::Run"),
            write_line(50, 1, "a1@Svc::conn", "0", "ee", "Svc::Init"),
            use_line(58, 3, "a1@Svc::conn", "Svc::Other"),
        ]);
        let mut analyzer = TraceAnalyzer::from_log(file.path()).unwrap();
        analyzer.compute_racy_pairs(100, true);
        analyzer.prune_duplicate_injection_points();
        assert_eq!(analyzer.injection_sites().len(), 1);
        assert_eq!(analyzer.races.len(), 1);
    }
}
