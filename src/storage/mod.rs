// SPDX-License-Identifier: MIT

//! Persisted tables
//!
//! Everything the analyzer hands to the scheduler, and everything a run
//! leaves behind for the next one, lives in tab-separated tables in the
//! working directory. The format is append-friendly plain text: a single
//! `#`-prefixed header row, then one record per line. Readers treat a
//! missing file as an empty table and skip rows they cannot parse, so a
//! truncated write from a killed process degrades to fewer candidates
//! rather than a failed run.

use crate::analyzer::InterferencePair;
use crate::event::MemoryAccessEvent;
use crate::history::RacyAccess;
use crate::types::{AccessKind, ReadType, StaticSite, ValueId, WriteType};
use crate::vclock;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

const CANDIDATES_HEADER: &str = "#(0)FieldName\t(1)AccessGapMs\t(2)WriteTimestamp\t(3)WriteType\t(4)WriteCaller\t(5)WriteILOffset\t(6)WritePerObjectAccessCount\t(7)WriteGlobalAccessCount\t(8)ReadTimestamp\t(9)ReadType\t(10)ReadCaller\t(11)ReadILOffset\t(12)ReadPerObjectAccessCount\t(13)ReadGlobalAccessCount";

const OVERLAPS_HEADER: &str = "#(0)FieldName\t(1)InterceptCaller\t(2)InterceptILOffset\t(3)OverlapCaller\t(4)OverlapILOffset\t(5)DynamicCount\t(6)OverlapLengthMs";

const PROBS_HEADER: &str = "#(0)Caller\t(1)ILOffset\t(2)Probability";

/// Writes the candidate-race table, replacing any previous one.
pub fn write_candidate_races(path: &Path, races: &[RacyAccess]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("cannot create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "{CANDIDATES_HEADER}")?;
    for race in races {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            race.write.field_name(),
            race.gap_ms,
            race.write.timestamp,
            race.write_type,
            race.write.site.caller,
            race.write.site.offset,
            race.write.per_object_seq,
            race.write.global_seq,
            race.read.timestamp,
            race.read_type,
            race.read.site.caller,
            race.read.site.offset,
            race.read.per_object_seq,
            race.read.global_seq,
        )?;
    }
    out.flush()?;
    Ok(())
}

/// Reads the candidate-race table back. The dynamic context that never made
/// it into the table (object identity, values, clocks) is reconstructed as
/// neutral placeholders; the scheduler only consumes the static half.
pub fn read_candidate_races(path: &Path) -> Result<Vec<RacyAccess>> {
    let mut races = Vec::new();
    for line in read_table_rows(path)? {
        if let Some(race) = parse_candidate_row(&line) {
            races.push(race);
        }
    }
    Ok(races)
}

fn parse_candidate_row(line: &str) -> Option<RacyAccess> {
    let t: Vec<&str> = line.split('\t').collect();
    if t.len() < 14 {
        return None;
    }

    let field = t[0];
    let write_type: WriteType = t[3].parse().ok()?;
    let read_type: ReadType = t[9].parse().ok()?;

    let (write_kind, old_value, new_value) = match write_type {
        WriteType::NullToNonNull => (AccessKind::Write, ValueId::NULL, ValueId(1)),
        WriteType::NonNullToNull => (AccessKind::Write, ValueId(1), ValueId::NULL),
        WriteType::Dispose => (AccessKind::Dispose, ValueId(1), ValueId(1)),
        WriteType::Other | WriteType::NotWrite => (AccessKind::Write, ValueId(1), ValueId(1)),
    };
    let read_kind = match read_type {
        ReadType::Read => AccessKind::Read,
        ReadType::Use => AccessKind::Use,
    };

    let write = Arc::new(MemoryAccessEvent {
        memory_id: field.to_string(),
        kind: write_kind,
        old_value,
        new_value,
        timestamp: t[2].parse().ok()?,
        thread_id: 0,
        task_id: 0,
        vector_clock: vclock::NO_CLOCK.to_string(),
        site: StaticSite::new(t[4], t[5].parse().ok()?),
        lock_depth: 0,
        per_object_seq: t[6].parse().ok()?,
        global_seq: t[7].parse().ok()?,
    });
    let read = Arc::new(MemoryAccessEvent {
        memory_id: field.to_string(),
        kind: read_kind,
        old_value: new_value,
        new_value,
        timestamp: t[8].parse().ok()?,
        thread_id: 1,
        task_id: 0,
        vector_clock: vclock::NO_CLOCK.to_string(),
        site: StaticSite::new(t[10], t[11].parse().ok()?),
        lock_depth: 0,
        per_object_seq: t[12].parse().ok()?,
        global_seq: t[13].parse().ok()?,
    });

    Some(RacyAccess::new(read, read_type, write, write_type))
}

/// Writes the interference table.
pub fn write_interference_pairs(path: &Path, pairs: &[InterferencePair]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("cannot create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "{OVERLAPS_HEADER}")?;
    for pair in pairs {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            pair.field_name,
            pair.intercept.caller,
            pair.intercept.offset,
            pair.overlap.caller,
            pair.overlap.offset,
            pair.dynamic_count,
            pair.overlap_length_ms,
        )?;
    }
    out.flush()?;
    Ok(())
}

pub fn read_interference_pairs(path: &Path) -> Result<Vec<InterferencePair>> {
    let mut pairs = Vec::new();
    for line in read_table_rows(path)? {
        let t: Vec<&str> = line.split('\t').collect();
        if t.len() < 7 {
            continue;
        }
        let (Ok(intercept_offset), Ok(overlap_offset)) = (t[2].parse(), t[4].parse()) else {
            continue;
        };
        let (Ok(dynamic_count), Ok(overlap_length_ms)) = (t[5].parse(), t[6].parse()) else {
            continue;
        };
        pairs.push(InterferencePair {
            field_name: t[0].to_string(),
            intercept: StaticSite::new(t[1], intercept_offset),
            overlap: StaticSite::new(t[3], overlap_offset),
            dynamic_count,
            overlap_length_ms,
        });
    }
    Ok(pairs)
}

/// Writes per-site injection probabilities, keyed by `caller|offset`.
pub fn write_probabilities(path: &Path, probs: &HashMap<String, f64>) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("cannot create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "{PROBS_HEADER}")?;

    let mut keys: Vec<&String> = probs.keys().collect();
    keys.sort();
    for key in keys {
        let Some(site) = StaticSite::parse(key) else {
            continue;
        };
        writeln!(out, "{}\t{}\t{}", site.caller, site.offset, probs[key])?;
    }
    out.flush()?;
    Ok(())
}

pub fn read_probabilities(path: &Path) -> Result<HashMap<String, f64>> {
    let mut probs = HashMap::new();
    for line in read_table_rows(path)? {
        let t: Vec<&str> = line.split('\t').collect();
        if t.len() < 3 {
            continue;
        }
        let (Ok(offset), Ok(prob)) = (t[1].parse::<u32>(), t[2].parse::<f64>()) else {
            continue;
        };
        probs.insert(StaticSite::new(t[0], offset).to_string(), prob);
    }
    Ok(probs)
}

/// Appends one run-summary line to the stats file.
pub fn append_stats_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot append to {}", path.display()))?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// Reads a table's data rows (header and blanks stripped). A missing file
/// is an empty table. Rows are decoded lossily, so a torn or mangled byte
/// sequence becomes a row the caller's parser will reject rather than an
/// error; a mid-file read failure ends the table at the rows seen so far.
fn read_table_rows(path: &Path) -> Result<Vec<String>> {
    let mut reader = match File::open(path) {
        Ok(file) => BufReader::new(file),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("cannot open {}", path.display())),
    };

    let mut rows = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                rows.push(line.to_string());
            }
            Err(_) => break,
        }
    }
    Ok(rows)
}
