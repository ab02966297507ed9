// SPDX-License-Identifier: MIT

//! Post-run review of injected delays
//!
//! A trace produced while the scheduler was active carries `DelayInjection`
//! records alongside the memory accesses. This pass pairs each recorded
//! delay with the same-object accesses that could have raced into its
//! window, giving per-delay effectiveness numbers for tuning.

use crate::event::{TraceLineParser, DELAY_INJECTION};
use crate::types::{gap_ms, AccessKind, StaticSite, WriteType};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// One `DelayInjection` record parsed out of a trace.
#[derive(Debug, Clone)]
pub struct DelayPoint {
    pub timestamp: u64,
    pub thread_id: u32,
    pub task_id: u64,
    pub delay_ms: u64,
    pub kind: AccessKind,
    pub memory_id: String,
    pub site: StaticSite,
}

impl DelayPoint {
    /// Parses a prefixed `DelayInjection` line; `None` for malformed input.
    pub fn parse_line(line: &str) -> Option<Self> {
        let tokens: Vec<&str> = line.split('\t').collect();
        if tokens.len() < 10 || tokens[4] != DELAY_INJECTION {
            return None;
        }
        Some(Self {
            timestamp: tokens[0].parse().ok()?,
            thread_id: tokens[1].parse().ok()?,
            task_id: tokens[2].parse().ok()?,
            delay_ms: tokens[5].parse().ok()?,
            kind: tokens[6].parse().ok()?,
            memory_id: tokens[7].to_string(),
            site: StaticSite::new(tokens[8], tokens[9].parse().ok()?),
        })
    }
}

/// Effectiveness numbers for one injected delay.
#[derive(Debug, Clone)]
pub struct PerDelayStats {
    /// `memory_id|caller|offset` of the delayed point.
    pub site_id: String,
    pub point_type: WriteType,
    pub delay_ms: u64,
    pub min_gap_ms: u64,
    pub max_gap_ms: u64,
    pub racy_pairs: u64,
    pub delays_injected: u64,
}

/// Reviews a scheduler-era trace.
pub struct DelayReview {
    delays: Vec<DelayPoint>,
    /// Same-object accesses, keyed by memory id.
    accesses: HashMap<String, Vec<(u64, u32, AccessKind)>>,
}

impl DelayReview {
    pub fn from_log(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("cannot open trace log {}", path.display()))?;

        let mut delays = Vec::new();
        let mut accesses: HashMap<String, Vec<(u64, u32, AccessKind)>> = HashMap::new();
        let mut parser = TraceLineParser::new();

        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            if let Some(point) = DelayPoint::parse_line(&line) {
                delays.push(point);
            } else if let Some(event) = parser.parse_line(&line) {
                if !event.memory_id.is_empty() {
                    accesses
                        .entry(event.memory_id)
                        .or_default()
                        .push((event.timestamp, event.thread_id, event.kind));
                }
            }
        }

        Ok(Self { delays, accesses })
    }

    pub fn delay_count(&self) -> usize {
        self.delays.len()
    }

    /// Pairs each delay with the conflicting same-object accesses that
    /// followed it on another thread.
    pub fn per_delay_stats(&self) -> Vec<PerDelayStats> {
        let mut stats = Vec::new();

        for delay in &self.delays {
            let Some(accesses) = self.accesses.get(&delay.memory_id) else {
                continue;
            };

            let (point_type, conflicting): (WriteType, AccessKind) = match delay.kind {
                AccessKind::Write => (WriteType::NullToNonNull, AccessKind::Use),
                AccessKind::Use | AccessKind::Dispose => (WriteType::NonNullToNull, AccessKind::Write),
                _ => continue,
            };

            let mut entry = PerDelayStats {
                site_id: format!("{}|{}", delay.memory_id, delay.site),
                point_type,
                delay_ms: delay.delay_ms,
                min_gap_ms: u64::MAX,
                max_gap_ms: 0,
                racy_pairs: 0,
                delays_injected: 1,
            };

            for &(ts, thread, kind) in accesses {
                if kind == conflicting && thread != delay.thread_id && ts >= delay.timestamp {
                    let gap = gap_ms(ts, delay.timestamp);
                    entry.min_gap_ms = entry.min_gap_ms.min(gap);
                    entry.max_gap_ms = entry.max_gap_ms.max(gap);
                    entry.racy_pairs += 1;
                }
            }

            if entry.racy_pairs == 0 {
                entry.min_gap_ms = 0;
            }
            stats.push(entry);
        }

        stats
    }
}

/// Renders the per-delay table in the persisted `#`-headed TSV shape.
pub fn render_stats_table(stats: &[PerDelayStats]) -> String {
    let mut out = String::from(
        "#(0)SiteId\t(1)DelayType\t(2)DelayMs\t(3)MinGapMs\t(4)MaxGapMs\t(5)DelaysInjected\t(6)PotentialRacyPairs\n",
    );
    for s in stats {
        let _ = writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            s.site_id, s.point_type, s.delay_ms, s.min_gap_ms, s.max_gap_ms, s.delays_injected, s.racy_pairs
        );
    }
    out
}
