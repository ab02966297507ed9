// SPDX-License-Identifier: MIT

//! Interference analysis between candidate injection sites
//!
//! Delaying a thread at one site can keep that thread from reaching another
//! site whose race we also want to observe. Two sites interfere when the
//! trace shows one executing, on the same thread as a candidate's
//! conflicting access, inside the candidate's time window. The scheduler
//! uses these pairs to refuse a delay while an interfering one is active.

use crate::analyzer::TraceAnalyzer;
use crate::history::RacyAccess;
use crate::types::{field_name_of, gap_ms, StaticSite, WriteType, TICKS_PER_MS};
use std::collections::{HashMap, HashSet};

/// Minimum separation before an access counts as overlapping a window.
const OVERLAP_WINDOW_TICKS: u64 = TICKS_PER_MS;

/// Two injection sites whose delay windows overlapped on one thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterferencePair {
    /// Field whose candidate race owns the window.
    pub field_name: String,
    /// The candidate's own injection site.
    pub intercept: StaticSite,
    /// The other site observed inside the window.
    pub overlap: StaticSite,
    /// How many dynamic instances of the overlap were seen.
    pub dynamic_count: u64,
    /// Cumulative slack between window length and observed gap, in ms.
    pub overlap_length_ms: u64,
}

impl TraceAnalyzer {
    /// Computes interference pairs among the surviving candidates' injection
    /// sites. Call after pruning by gap, before deduplication collapses the
    /// dynamic instances.
    pub fn compute_interference_pairs(&self, near_miss_ms: u64) -> Vec<InterferencePair> {
        let sites: HashSet<String> = self
            .races
            .iter()
            .map(|race| race.injection_site().to_string())
            .collect();

        let mut pairs: HashMap<String, InterferencePair> = HashMap::new();

        for access in self.trace() {
            if !sites.contains(&access.site.to_string()) {
                continue;
            }

            for race in &self.races {
                let Some((owner, window_start, window_end, same_thread)) = window_of(race) else {
                    continue;
                };
                if access.thread_id != same_thread {
                    continue;
                }
                if window_start + OVERLAP_WINDOW_TICKS > access.timestamp
                    || access.timestamp > window_end
                {
                    continue;
                }

                let key = format!("{}!{}", owner.site, access.site);
                let entry = pairs.entry(key).or_insert_with(|| InterferencePair {
                    field_name: field_name_of(&owner.memory_id).to_string(),
                    intercept: owner.site.clone(),
                    overlap: access.site.clone(),
                    dynamic_count: 0,
                    overlap_length_ms: 0,
                });
                entry.dynamic_count += 1;
                entry.overlap_length_ms +=
                    near_miss_ms.saturating_sub(gap_ms(access.timestamp, owner.timestamp));
            }
        }

        let mut result: Vec<InterferencePair> = pairs.into_values().collect();
        result.sort_by(|a, b| {
            (a.intercept.to_string(), a.overlap.to_string())
                .cmp(&(b.intercept.to_string(), b.overlap.to_string()))
        });
        result
    }
}

/// The delay window of a candidate: (owning access, start, end, the thread
/// whose stall would mask the conflicting access).
fn window_of(
    race: &RacyAccess,
) -> Option<(&crate::event::MemoryAccessEvent, u64, u64, u32)> {
    match race.write_type {
        WriteType::NullToNonNull => Some((
            &*race.write,
            race.write.timestamp,
            race.read.timestamp,
            race.read.thread_id,
        )),
        WriteType::NonNullToNull | WriteType::Dispose => Some((
            &*race.read,
            race.read.timestamp,
            race.write.timestamp,
            race.write.thread_id,
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::TraceAnalyzer;
    use crate::types::TICKS_PER_MS;
    use std::io::Write as _;

    #[test]
    fn overlapping_site_on_conflicting_thread_is_reported() {
        // Two fields, each with a use-before-init pair; the second field's
        // init write (thread 2, also the first race's reading thread) lands
        // inside the first race's window.
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let lines = [
            format!(
                "{}\t1\t0\t1\tBeforeFieldWrite\ta1@Svc::conn\t0\tff\tSvc::Init\t1",
                0
            ),
            format!(
                "{}\t2\t0\t2\tBeforeFieldWrite\tb2@Svc::pool\t0\tee\tSvc::Warm\t7",
                3 * TICKS_PER_MS
            ),
            format!(
                "{}\t2\t0\t2\tBeforeMethodCall\ta1@Svc::conn\tConn::Send\tSvc::Run\t4",
                10 * TICKS_PER_MS
            ),
            format!(
                "{}\t3\t0\t3\tBeforeMethodCall\tb2@Svc::pool\tPool::Get\tSvc::Drain\t9",
                6 * TICKS_PER_MS
            ),
        ];
        for line in &lines {
            writeln!(file, "{line}").unwrap();
        }

        let mut analyzer = TraceAnalyzer::from_log(file.path()).unwrap();
        analyzer.compute_racy_pairs(100, true);
        assert_eq!(analyzer.races.len(), 2);

        let pairs = analyzer.compute_interference_pairs(100);
        let found = pairs.iter().any(|p| {
            p.intercept == StaticSite::new("Svc::Init", 1)
                && p.overlap == StaticSite::new("Svc::Warm", 7)
        });
        assert!(found, "expected Svc::Init window to intercept Svc::Warm: {pairs:?}");
        let pair = pairs
            .iter()
            .find(|p| p.overlap == StaticSite::new("Svc::Warm", 7))
            .unwrap();
        assert_eq!(pair.dynamic_count, 1);
        assert_eq!(pair.overlap_length_ms, 100 - 3);
    }
}
