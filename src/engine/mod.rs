// SPDX-License-Identifier: MIT

//! Online engine
//!
//! The host embeds one [`TorchEngine`] and routes its instrumentation
//! callbacks here. Callbacks log what they saw, feed the scheduler's
//! confirmation machinery, and occasionally park the calling thread per
//! the loaded delay plans. Nothing in this module is allowed to unwind
//! into the host: fallible work happens at startup and shutdown, and the
//! per-access path absorbs every failure it can meet.

pub mod logger;
pub mod scheduler;

use crate::clock::TickClock;
use crate::config::EngineConfig;
use crate::event::{
    AFTER_FIELD_WRITE, AFTER_METHOD_CALL, BEFORE_FIELD_READ, BEFORE_FIELD_WRITE,
    BEFORE_METHOD_CALL, DELAY_INJECTION,
};
use crate::storage;
use crate::types::{AccessKind, StaticSite, ValueId, DISPOSE_SUFFIX, LOCK_ENTER_CALLEE, LOCK_EXIT_CALLEE};
use crate::vclock::{self, ChildClock};
use anyhow::Result;
use chrono::Utc;
use logger::TraceLogger;
use scheduler::{DelayScheduler, InjectionPoint};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Everything a method-entry callback resolved, handed back opaquely to the
/// matching return hook by the instrumentation layer.
#[derive(Debug, Clone)]
pub struct MethodCallContext {
    pub memory_id: String,
    callee: String,
    caller: String,
    offset: u32,
    instance: ValueId,
}

/// Shared per-process instrumentation state.
pub struct TorchEngine {
    config: EngineConfig,
    clock: TickClock,
    logger: TraceLogger,
    scheduler: DelayScheduler,
    /// Last memory id each non-null value was written into; lets method
    /// calls on a value be attributed back to the field holding it.
    field_table: Mutex<HashMap<ValueId, String>>,
    shut_down: AtomicBool,
}

impl TorchEngine {
    /// Loads configuration and any persisted tables from `working_dir`.
    pub fn start(working_dir: &std::path::Path) -> Result<Self> {
        let config = EngineConfig::load(working_dir);
        let scheduler = DelayScheduler::from_tables(&config)?;
        let logger = TraceLogger::new(&config.trace_log_path(), config.logging_disabled);
        Ok(Self {
            config,
            clock: TickClock::new(),
            logger,
            scheduler,
            field_table: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &DelayScheduler {
        &self.scheduler
    }

    /// A field is about to be read.
    pub fn before_field_read(&self, memory_id: &str, value: ValueId, caller: &str, offset: u32) {
        let ticks = self.clock.elapsed_ticks();
        self.logger.log(
            ticks,
            &format!("{BEFORE_FIELD_READ}\t{memory_id}\t{value}\t{caller}\t{offset}"),
        );
        self.scheduler.note_access(
            memory_id,
            &site_key(caller, offset),
            AccessKind::Read,
            vclock::thread_ident(),
            ticks,
        );
    }

    /// A field is about to be written. Construction-like writes at planned
    /// sites are where use-before-init delays park.
    pub fn before_field_write(
        &self,
        memory_id: &str,
        old_value: ValueId,
        new_value: ValueId,
        caller: &str,
        offset: u32,
    ) {
        let ticks = self.clock.elapsed_ticks();
        self.logger.log(
            ticks,
            &format!("{BEFORE_FIELD_WRITE}\t{memory_id}\t{old_value}\t{new_value}\t{caller}\t{offset}"),
        );

        let site = site_key(caller, offset);
        let thread = vclock::thread_ident();
        self.scheduler
            .note_access(memory_id, &site, AccessKind::Write, thread, ticks);

        if old_value.is_null() && !new_value.is_null() {
            self.maybe_delay(&site, memory_id, InjectionPoint::BeforeWrite, caller, offset, thread);
        }
    }

    /// A field write just retired; the value-to-field attribution table
    /// picks up the new value here.
    pub fn after_field_write(&self, memory_id: &str, value: ValueId, caller: &str, offset: u32) {
        let ticks = self.clock.elapsed_ticks();
        self.logger.log(
            ticks,
            &format!("{AFTER_FIELD_WRITE}\t{memory_id}\t{value}\t{caller}\t{offset}"),
        );
        if !value.is_null() {
            let mut table = self.lock_field_table();
            table.insert(value, memory_id.to_string());
        }
    }

    /// A method is about to be invoked on `instance`. Only calls whose
    /// receiver is attributable to a tracked field produce records; monitor
    /// enter/exit is logged as lock traffic and never delayed. The returned
    /// context identifies the resolved field for the matching return hook.
    pub fn before_method_call(
        &self,
        instance: ValueId,
        callee: &str,
        caller: &str,
        offset: u32,
    ) -> Option<MethodCallContext> {
        let memory_id = self.field_for(instance)?;
        let ticks = self.clock.elapsed_ticks();
        self.logger.log(
            ticks,
            &format!("{BEFORE_METHOD_CALL}\t{memory_id}\t{callee}\t{caller}\t{offset}"),
        );

        let context = MethodCallContext {
            memory_id,
            callee: callee.to_string(),
            caller: caller.to_string(),
            offset,
            instance,
        };

        if callee == LOCK_ENTER_CALLEE || callee == LOCK_EXIT_CALLEE {
            return Some(context);
        }

        let site = site_key(caller, offset);
        let thread = vclock::thread_ident();
        self.scheduler
            .note_access(&context.memory_id, &site, AccessKind::Use, thread, ticks);
        self.maybe_delay(
            &site,
            &context.memory_id,
            InjectionPoint::BeforeUse,
            caller,
            offset,
            thread,
        );
        Some(context)
    }

    /// The call described by `context` just returned. Disposal is the only
    /// return edge the detector cares about.
    pub fn after_method_call(&self, context: &MethodCallContext) {
        if !context.callee.ends_with(DISPOSE_SUFFIX) {
            return;
        }
        let ticks = self.clock.elapsed_ticks();
        self.logger.log(
            ticks,
            &format!(
                "{AFTER_METHOD_CALL}\t{}\t{}\t{}\t{}\t{}",
                context.memory_id, context.callee, context.caller, context.offset, context.instance
            ),
        );
        self.scheduler.note_access(
            &context.memory_id,
            &site_key(&context.caller, context.offset),
            AccessKind::Dispose,
            vclock::thread_ident(),
            ticks,
        );
    }

    /// The current thread is about to spawn another; the returned clock
    /// must be handed to [`TorchEngine::on_thread_start`] in the child.
    pub fn on_thread_fork(&self) -> ChildClock {
        vclock::fork()
    }

    pub fn on_thread_start(&self, clock: ChildClock) {
        vclock::adopt(clock);
    }

    pub fn on_task_switch(&self, task_id: u64) {
        vclock::set_task_ident(task_id);
    }

    /// Flushes the trace and persists scheduler state. Idempotent; later
    /// calls are no-ops.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.logger.flush();

        storage::write_probabilities(&self.config.probs_path(), &self.scheduler.snapshot_probabilities())?;
        storage::append_stats_line(
            &self.config.stats_path(),
            &format!(
                "{}\tdelays={}\ttotal_delay_ms={}\tconfirmed={}\tsuppressed={}",
                Utc::now().to_rfc3339(),
                self.scheduler.delay_count(),
                self.scheduler.total_delay_ms(),
                self.scheduler.confirmed_count(),
                self.scheduler.suppressed_count(),
            ),
        )?;
        Ok(())
    }

    fn maybe_delay(
        &self,
        site: &str,
        memory_id: &str,
        point: InjectionPoint,
        caller: &str,
        offset: u32,
        thread: u32,
    ) {
        let ticks = self.clock.elapsed_ticks();
        if let Some(outcome) = self.scheduler.try_to_delay(site, memory_id, point, thread, ticks) {
            let kind = match point {
                InjectionPoint::BeforeWrite => AccessKind::Write,
                InjectionPoint::BeforeUse => AccessKind::Use,
            };
            self.logger.log(
                ticks,
                &format!(
                    "{DELAY_INJECTION}\t{}\t{kind}\t{memory_id}\t{caller}\t{offset}",
                    outcome.delay_ms
                ),
            );
        }
    }

    fn field_for(&self, instance: ValueId) -> Option<String> {
        if instance.is_null() {
            return None;
        }
        let table = self.lock_field_table();
        table.get(&instance).cloned()
    }

    fn lock_field_table(&self) -> std::sync::MutexGuard<'_, HashMap<ValueId, String>> {
        self.field_table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for TorchEngine {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn site_key(caller: &str, offset: u32) -> String {
    StaticSite::new(caller, offset).to_string()
}
