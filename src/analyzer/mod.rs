// SPDX-License-Identifier: MIT

//! Offline trace analysis
//!
//! Takes a trace log produced by the engine and reduces it to a table of
//! candidate racy pairs, optionally with interference pairs for the
//! scheduler's suppression logic and per-delay effectiveness stats.

pub mod conflicts;
pub mod delays;
pub mod interference;

pub use conflicts::TraceAnalyzer;
pub use delays::{DelayPoint, DelayReview, PerDelayStats};
pub use interference::InterferencePair;

use crate::config::EngineConfig;
use crate::storage;
use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

/// How much pruning the candidate table gets before it is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AnalysisMode {
    /// Every near-miss pair, no happens-before filtering, no dedup.
    All,
    /// Happens-before filtered, gap-pruned, one candidate per static pair.
    Unique,
    /// Like `unique`, then collapsed further to one per injection site.
    UniqueInjectionPoints,
    /// No output files; just compares filtered and unfiltered counts.
    Stats,
}

/// What one analysis run found, in a shape `serde_json` can export.
#[derive(Debug, Serialize)]
pub struct AnalysisSummary {
    pub trace_events: usize,
    pub racy_fields: Vec<String>,
    pub candidate_pairs: usize,
    pub pairs_by_write_type: HashMap<String, usize>,
    pub interference_pairs: usize,
    /// Pairs the happens-before check removed; only filled by `stats`.
    pub hb_suppressed: Option<usize>,
}

/// Runs one full analysis pass and persists its tables under `out_dir`.
pub fn run(
    mode: AnalysisMode,
    trace_path: &Path,
    out_dir: &Path,
    config: &EngineConfig,
) -> Result<AnalysisSummary> {
    let mut analyzer = TraceAnalyzer::from_log(trace_path)?;
    let near_miss = config.near_miss_window_ms;
    let mut interference = Vec::new();
    let mut hb_suppressed = None;

    match mode {
        AnalysisMode::All => {
            analyzer.compute_racy_pairs(near_miss, false);
            storage::write_candidate_races(&out_dir.join(crate::config::CANDIDATES_FILE_NAME), &analyzer.races)?;
        }
        AnalysisMode::Unique | AnalysisMode::UniqueInjectionPoints => {
            analyzer.compute_racy_pairs(near_miss, true);
            analyzer.prune_large_gaps(near_miss);
            // Interference looks at every surviving dynamic instance, so it
            // has to run before the table collapses to static pairs.
            interference = analyzer.compute_interference_pairs(near_miss);
            analyzer.prune_duplicates_keep_largest_gap();
            if mode == AnalysisMode::UniqueInjectionPoints {
                analyzer.prune_duplicate_injection_points();
            }
            storage::write_candidate_races(&out_dir.join(crate::config::CANDIDATES_FILE_NAME), &analyzer.races)?;
            storage::write_interference_pairs(&out_dir.join(crate::config::OVERLAPS_FILE_NAME), &interference)?;
        }
        AnalysisMode::Stats => {
            analyzer.compute_racy_pairs(near_miss, false);
            let unfiltered = analyzer.races.len();
            analyzer.compute_racy_pairs(near_miss, true);
            hb_suppressed = Some(unfiltered.saturating_sub(analyzer.races.len()));
        }
    }

    let pairs_by_write_type = analyzer
        .count_by_write_type()
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

    Ok(AnalysisSummary {
        trace_events: analyzer.trace().len(),
        racy_fields: analyzer.racy_fields().iter().map(|f| f.to_string()).collect(),
        candidate_pairs: analyzer.races.len(),
        pairs_by_write_type,
        interference_pairs: interference.len(),
        hb_suppressed,
    })
}
