// SPDX-License-Identifier: MIT

//! torchlite: trace analysis front end for the TorchLite race finder
//!
//! The online half lives in the library and runs inside the instrumented
//! process; this binary drives the offline half against a recorded trace.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use torchlite::analyzer::{self, AnalysisMode, DelayReview, TraceAnalyzer};
use torchlite::config::EngineConfig;

#[derive(Parser)]
#[command(name = "torchlite")]
#[command(version = "0.9.0")]
#[command(about = "Infers data-race candidates from execution traces and plans delay injection")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a trace log and persist candidate/interference tables
    Analyze {
        /// Trace log to analyze
        #[arg(value_name = "TRACE")]
        trace: PathBuf,

        /// How aggressively to prune the candidate table
        #[arg(short, long, value_enum, default_value = "unique")]
        mode: AnalysisMode,

        /// Directory the tables are written to (default: trace's directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write a JSON summary of the run
        #[arg(short, long)]
        json: Option<PathBuf>,
    },

    /// Review how effective the delays recorded in a trace were
    DelayStats {
        /// Trace log containing DelayInjection records
        #[arg(value_name = "TRACE")]
        trace: PathBuf,

        /// Write the per-delay table to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the fields whose access patterns look racy
    RacyFields {
        /// Trace log to scan
        #[arg(value_name = "TRACE")]
        trace: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            trace,
            mode,
            output,
            json,
        } => {
            let out_dir = match output {
                Some(dir) => dir,
                None => trace
                    .parent()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(".")),
            };
            let config = EngineConfig::load(&out_dir);

            println!("Analyzing trace: {}", trace.display());
            let summary = analyzer::run(mode, &trace, &out_dir, &config)?;

            println!("\n{}", "ANALYSIS SUMMARY".bold().yellow());
            println!("  Trace events: {}", summary.trace_events);
            println!("  Racy fields: {}", summary.racy_fields.len());
            println!("  Candidate pairs: {}", summary.candidate_pairs);
            for (write_type, count) in &summary.pairs_by_write_type {
                println!("    {write_type}: {count}");
            }
            println!("  Interference pairs: {}", summary.interference_pairs);
            if let Some(suppressed) = summary.hb_suppressed {
                println!("  Suppressed by happens-before: {suppressed}");
            }

            if let Some(json_path) = json {
                let rendered = serde_json::to_string_pretty(&summary)?;
                std::fs::write(&json_path, rendered)
                    .with_context(|| format!("cannot write {}", json_path.display()))?;
                println!("Summary saved to: {}", json_path.display());
            }
        }

        Commands::DelayStats { trace, output } => {
            let review = DelayReview::from_log(&trace)?;
            println!("Delays recorded: {}", review.delay_count());

            let stats = review.per_delay_stats();
            let table = analyzer::delays::render_stats_table(&stats);
            match output {
                Some(path) => {
                    std::fs::write(&path, table)
                        .with_context(|| format!("cannot write {}", path.display()))?;
                    println!("Per-delay table saved to: {}", path.display());
                }
                None => {
                    println!("\n{}", "PER-DELAY EFFECTIVENESS".bold().yellow());
                    print!("{table}");
                }
            }
        }

        Commands::RacyFields { trace } => {
            let analyzer = TraceAnalyzer::from_log(&trace)?;
            let fields = analyzer.racy_fields();
            if fields.is_empty() {
                println!("{}", "No racy fields found.".green());
            } else {
                println!("{}", format!("{} racy field(s):", fields.len()).bold().red());
                for field in fields {
                    println!("  {field}");
                }
            }
        }
    }

    Ok(())
}
