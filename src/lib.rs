// SPDX-License-Identifier: MIT

//! TorchLite: lightweight dynamic race finding for managed binaries.
//!
//! The crate has two halves that share one trace format:
//! 1. **Engine**: embedded in the instrumented process. Logs memory
//!    accesses, and on later runs injects probabilistic delays at the
//!    sites the analyzer flagged, trying to flip access orders until a
//!    latent race actually fires.
//! 2. **Analyzer**: offline. Replays a trace log through per-object
//!    access histories, infers use-before-init and use-after-free
//!    candidates from near-miss timing, and persists the candidate and
//!    interference tables the engine feeds on.

pub mod analyzer;
pub mod clock;
pub mod config;
pub mod engine;
pub mod event;
pub mod history;
pub mod storage;
pub mod types;
pub mod vclock;
