// SPDX-License-Identifier: MIT

//! Adaptive delay injection
//!
//! The scheduler turns the analyzer's candidate table into per-site delay
//! plans. When the instrumented program reaches a planned site, the
//! scheduler draws against that site's probability and, on a hit, parks
//! the thread long enough for the paired access to arrive. A delay that
//! provokes the paired access is an order-violation confirmation and keeps
//! its probability; a delay that provokes nothing decays toward a floor,
//! then resets, so stale plans stay cheap without going silent forever.

use crate::config::EngineConfig;
use crate::storage;
use crate::types::{AccessKind, WriteType, TICKS_PER_MS};
use crate::vclock;
use anyhow::Result;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Which side of a candidate pair a plan parks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionPoint {
    /// Park before a construction-like write, letting a premature use win.
    BeforeWrite,
    /// Park before a use, letting a teardown write win.
    BeforeUse,
}

/// One static site's delay plan.
#[derive(Debug, Clone)]
pub struct DelayPlan {
    pub field_name: String,
    pub point: InjectionPoint,
    /// Longest delay any dynamic instance of this site justified.
    pub delay_ms: u64,
}

/// A confirmed ordering flip: the paired access arrived while its partner
/// was parked.
#[derive(Debug, Clone)]
pub struct OrderViolation {
    pub delayed_site: String,
    pub conflicting_site: String,
    pub memory_id: String,
    pub timestamp: u64,
}

/// What one `try_to_delay` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayOutcome {
    pub delay_ms: u64,
    pub confirmed: bool,
}

struct ActiveDelay {
    site: String,
    memory_id: String,
    thread_id: u32,
    /// Parked thread's clock at registration; accesses it causally
    /// precedes or follows cannot confirm the flip.
    clock: String,
    point: InjectionPoint,
    confirmed: Arc<AtomicBool>,
    conflicting_site: Arc<Mutex<String>>,
}

/// A completed delay kept around briefly so a conflicting access that lands
/// just after the parked thread resumed still counts as an order violation.
#[derive(Debug, Clone)]
struct RecentDelay {
    site: String,
    memory_id: String,
    thread_id: u32,
    clock: String,
    point: InjectionPoint,
    end_ticks: u64,
}

/// Run-wide delay state shared by every callback.
pub struct DelayScheduler {
    plans: HashMap<String, DelayPlan>,
    /// Candidate identity keys, `writesite!readsite`.
    pair_keys: HashSet<String>,
    /// Injection site -> sites whose windows were seen overlapping it.
    interference: HashMap<String, HashSet<String>>,
    probabilities: Mutex<HashMap<String, f64>>,
    active: Mutex<Vec<ActiveDelay>>,
    recent: Mutex<VecDeque<RecentDelay>>,
    violations: Mutex<Vec<OrderViolation>>,
    prob_decay_step: f64,
    zero_probability: f64,
    delay_history_count: usize,
    near_miss_ticks: u64,
    total_delay_ms: AtomicU64,
    delay_count: AtomicU64,
    suppressed_count: AtomicU64,
    confirmed_count: AtomicU64,
    late_confirmed_count: AtomicU64,
}

impl DelayScheduler {
    /// Builds plans from the persisted candidate, interference and
    /// probability tables under the configured working directory. Missing
    /// tables yield a scheduler with no plans, which never delays.
    pub fn from_tables(config: &EngineConfig) -> Result<Self> {
        let races = storage::read_candidate_races(&config.candidates_path())?;
        let stored_probs = storage::read_probabilities(&config.probs_path())?;
        let overlaps = storage::read_interference_pairs(&config.overlaps_path())?;

        let mut plans: HashMap<String, DelayPlan> = HashMap::new();
        let mut pair_keys = HashSet::new();
        for race in &races {
            pair_keys.insert(race.pair_key());

            let site = race.injection_site().to_string();
            let point = match race.write_type {
                WriteType::NullToNonNull => InjectionPoint::BeforeWrite,
                _ => InjectionPoint::BeforeUse,
            };
            let wanted = ((race.gap_ms + 1) as f64 * config.delay_factor) as u64;
            let delay_ms = wanted.min(config.max_delay_ms).max(config.min_delay_ms);

            plans
                .entry(site)
                .and_modify(|plan| plan.delay_ms = plan.delay_ms.max(delay_ms))
                .or_insert_with(|| DelayPlan {
                    field_name: race.write.field_name().to_string(),
                    point,
                    delay_ms,
                });
        }

        let mut probabilities = HashMap::new();
        for site in plans.keys() {
            // a plan parked at the floor gets a fresh shot each run
            let p = match stored_probs.get(site).copied() {
                Some(p) if p > config.zero_probability => p,
                _ => 1.0,
            };
            probabilities.insert(site.clone(), p);
        }

        let mut interference: HashMap<String, HashSet<String>> = HashMap::new();
        for pair in overlaps {
            interference
                .entry(pair.intercept.to_string())
                .or_default()
                .insert(pair.overlap.to_string());
        }

        Ok(Self {
            plans,
            pair_keys,
            interference,
            probabilities: Mutex::new(probabilities),
            active: Mutex::new(Vec::new()),
            recent: Mutex::new(VecDeque::new()),
            violations: Mutex::new(Vec::new()),
            prob_decay_step: config.prob_decay_step,
            zero_probability: config.zero_probability,
            delay_history_count: config.delay_history_count,
            near_miss_ticks: config.near_miss_window_ms * TICKS_PER_MS,
            total_delay_ms: AtomicU64::new(0),
            delay_count: AtomicU64::new(0),
            suppressed_count: AtomicU64::new(0),
            confirmed_count: AtomicU64::new(0),
            late_confirmed_count: AtomicU64::new(0),
        })
    }

    pub fn has_plans(&self) -> bool {
        !self.plans.is_empty()
    }

    pub fn plan_for(&self, site: &str) -> Option<&DelayPlan> {
        self.plans.get(site)
    }

    /// Considers delaying the current thread at `site` before it performs an
    /// access with `point` semantics on `memory_id`. Returns what happened,
    /// or `None` when no delay was injected.
    pub fn try_to_delay(
        &self,
        site: &str,
        memory_id: &str,
        point: InjectionPoint,
        thread_id: u32,
        now_ticks: u64,
    ) -> Option<DelayOutcome> {
        let plan = self.plans.get(site)?;
        if plan.point != point {
            return None;
        }

        let probability = {
            let probs = self.lock_probs();
            probs.get(site).copied().unwrap_or(0.0)
        };
        if draw() >= probability {
            return None;
        }

        if self.is_interfered(site, thread_id) {
            self.suppressed_count.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let confirmed = Arc::new(AtomicBool::new(false));
        let conflicting_site = Arc::new(Mutex::new(String::new()));
        let clock = vclock::current();
        {
            let mut active = self.lock_active();
            active.push(ActiveDelay {
                site: site.to_string(),
                memory_id: memory_id.to_string(),
                thread_id,
                clock: clock.clone(),
                point,
                confirmed: Arc::clone(&confirmed),
                conflicting_site: Arc::clone(&conflicting_site),
            });
        }

        std::thread::sleep(Duration::from_millis(plan.delay_ms));

        {
            let mut active = self.lock_active();
            active.retain(|d| !(d.thread_id == thread_id && d.site == site));
        }

        let hit = confirmed.load(Ordering::Acquire);
        if hit {
            self.confirmed_count.fetch_add(1, Ordering::Relaxed);
            let conflicting = lock_plain(&conflicting_site).clone();
            self.lock_violations().push(OrderViolation {
                delayed_site: site.to_string(),
                conflicting_site: conflicting,
                memory_id: memory_id.to_string(),
                timestamp: now_ticks,
            });
        } else {
            self.decay(site);
        }

        self.total_delay_ms.fetch_add(plan.delay_ms, Ordering::Relaxed);
        self.delay_count.fetch_add(1, Ordering::Relaxed);
        {
            let mut recent = self.lock_recent();
            recent.push_back(RecentDelay {
                site: site.to_string(),
                memory_id: memory_id.to_string(),
                thread_id,
                clock,
                point,
                end_ticks: now_ticks + plan.delay_ms * TICKS_PER_MS,
            });
            while recent.len() > self.delay_history_count {
                recent.pop_front();
            }
        }

        Some(DelayOutcome {
            delay_ms: plan.delay_ms,
            confirmed: hit,
        })
    }

    /// Reports an access so parked threads can learn the paired access
    /// arrived first. Called from every field and method callback.
    pub fn note_access(
        &self,
        memory_id: &str,
        site: &str,
        kind: AccessKind,
        thread_id: u32,
        now_ticks: u64,
    ) {
        if self.plans.is_empty() {
            return;
        }
        let access_clock = vclock::current();
        {
            let active = self.lock_active();
            for delay in active.iter() {
                if delay.thread_id == thread_id
                    || delay.memory_id != memory_id
                    || ordered_by_fork(&delay.clock, &access_clock)
                {
                    continue;
                }
                let (conflicts, key) = pair_of(delay.point, &delay.site, site, kind);
                if conflicts && self.pair_keys.contains(&key) {
                    delay.confirmed.store(true, Ordering::Release);
                    *lock_plain(&delay.conflicting_site) = site.to_string();
                }
            }
        }

        // An access landing just after a delay ended still demonstrates the
        // flipped ordering, it just was not provoked in time.
        let mut recent = self.lock_recent();
        let mut hit = None;
        for (idx, delay) in recent.iter().enumerate() {
            if delay.thread_id == thread_id
                || delay.memory_id != memory_id
                || now_ticks < delay.end_ticks
                || now_ticks - delay.end_ticks > self.near_miss_ticks
                || ordered_by_fork(&delay.clock, &access_clock)
            {
                continue;
            }
            let (conflicts, key) = pair_of(delay.point, &delay.site, site, kind);
            if conflicts && self.pair_keys.contains(&key) {
                hit = Some(idx);
                break;
            }
        }
        if let Some(delay) = hit.and_then(|idx| recent.remove(idx)) {
            drop(recent);
            self.late_confirmed_count.fetch_add(1, Ordering::Relaxed);
            self.lock_violations().push(OrderViolation {
                delayed_site: delay.site,
                conflicting_site: site.to_string(),
                memory_id: memory_id.to_string(),
                timestamp: now_ticks,
            });
        }
    }

    /// Decays one site's probability past the floor, then resets it so a
    /// cold plan eventually gets another full-probability shot.
    fn decay(&self, site: &str) {
        let mut probs = self.lock_probs();
        if let Some(p) = probs.get_mut(site) {
            *p = if *p > self.zero_probability {
                (*p - self.prob_decay_step).max(self.zero_probability)
            } else {
                1.0
            };
        }
    }

    fn is_interfered(&self, site: &str, thread_id: u32) -> bool {
        let Some(overlapping) = self.interference.get(site) else {
            return false;
        };
        let active = self.lock_active();
        active
            .iter()
            .any(|d| d.thread_id != thread_id && overlapping.contains(&d.site))
    }

    /// Number of threads currently parked in a delay.
    pub fn active_delay_count(&self) -> usize {
        self.lock_active().len()
    }

    pub fn snapshot_probabilities(&self) -> HashMap<String, f64> {
        self.lock_probs().clone()
    }

    pub fn order_violations(&self) -> Vec<OrderViolation> {
        self.lock_violations().clone()
    }

    pub fn delay_count(&self) -> u64 {
        self.delay_count.load(Ordering::Relaxed)
    }

    pub fn total_delay_ms(&self) -> u64 {
        self.total_delay_ms.load(Ordering::Relaxed)
    }

    pub fn suppressed_count(&self) -> u64 {
        self.suppressed_count.load(Ordering::Relaxed)
    }

    pub fn confirmed_count(&self) -> u64 {
        self.confirmed_count.load(Ordering::Relaxed)
    }

    /// Order violations observed after the parked thread had already
    /// resumed.
    pub fn late_confirmed_count(&self) -> u64 {
        self.late_confirmed_count.load(Ordering::Relaxed)
    }

    fn lock_probs(&self) -> std::sync::MutexGuard<'_, HashMap<String, f64>> {
        self.probabilities.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Vec<ActiveDelay>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_recent(&self) -> std::sync::MutexGuard<'_, VecDeque<RecentDelay>> {
        self.recent.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_violations(&self) -> std::sync::MutexGuard<'_, Vec<OrderViolation>> {
        self.violations.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn lock_plain<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Whether `kind` at `access_site` conflicts with a delay parked at
/// `delayed_site`, and the candidate key identifying the pair.
fn pair_of(
    point: InjectionPoint,
    delayed_site: &str,
    access_site: &str,
    kind: AccessKind,
) -> (bool, String) {
    match point {
        InjectionPoint::BeforeWrite => (
            kind.is_read_like(),
            format!("{delayed_site}!{access_site}"),
        ),
        InjectionPoint::BeforeUse => (
            kind.is_write_like(),
            format!("{access_site}!{delayed_site}"),
        ),
    }
}

/// True iff a fork edge orders the delayed context before or after the
/// accessing one. Equal paths mean no fork happened between two distinct
/// threads, so only a strict prefix relation counts as ordered.
fn ordered_by_fork(delayed_clock: &str, access_clock: &str) -> bool {
    delayed_clock != access_clock && vclock::is_ancestor(delayed_clock, access_clock)
}

/// Uniform draw in `[0, 1)`; a failed entropy read skips the delay.
fn draw() -> f64 {
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        return 1.0;
    }
    let bits = u64::from_le_bytes(bytes) >> 11;
    bits as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::io::Write as _;

    fn config_in(dir: &std::path::Path) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.working_dir = dir.to_path_buf();
        config
    }

    fn write_candidates(dir: &std::path::Path, rows: &[&str]) {
        let mut file = std::fs::File::create(dir.join("Candidates.wfl")).unwrap();
        writeln!(file, "#header").unwrap();
        for row in rows {
            writeln!(file, "{row}").unwrap();
        }
    }

    #[test]
    fn plans_load_with_bounded_delays_and_fresh_probabilities() {
        let dir = tempfile::tempdir().unwrap();
        // gap 7ms: wanted delay is (7+1)*1.15 = 9ms
        write_candidates(
            dir.path(),
            &["Svc::conn\t7\t100000\tNullToNonNull\tSvc::Init\t12\t1\t1\t170000\tUse\tSvc::Run\t30\t2\t1"],
        );

        let sched = DelayScheduler::from_tables(&config_in(dir.path())).unwrap();
        assert!(sched.has_plans());

        let plan = sched.plan_for("Svc::Init|12").unwrap();
        assert_eq!(plan.point, InjectionPoint::BeforeWrite);
        assert_eq!(plan.delay_ms, 9);
        assert_eq!(sched.snapshot_probabilities()["Svc::Init|12"], 1.0);
        assert!(sched.pair_keys.contains("Svc::Init|12!Svc::Run|30"));
    }

    #[test]
    fn huge_gaps_are_clamped_to_max_delay() {
        let dir = tempfile::tempdir().unwrap();
        write_candidates(
            dir.path(),
            &["Svc::conn\t95\t100000\tNonNullToNull\tSvc::Stop\t5\t1\t1\t1050000\tUse\tSvc::Run\t30\t2\t1"],
        );

        let sched = DelayScheduler::from_tables(&config_in(dir.path())).unwrap();
        // use-after-free plans park the use side
        let plan = sched.plan_for("Svc::Run|30").unwrap();
        assert_eq!(plan.point, InjectionPoint::BeforeUse);
        assert_eq!(plan.delay_ms, 100);
    }

    #[test]
    fn missing_tables_mean_no_plans() {
        let dir = tempfile::tempdir().unwrap();
        let sched = DelayScheduler::from_tables(&config_in(dir.path())).unwrap();
        assert!(!sched.has_plans());
        assert!(sched
            .try_to_delay("Svc::Init|12", "a1@Svc::conn", InjectionPoint::BeforeWrite, 1, 0)
            .is_none());
    }

    #[test]
    fn decay_walks_to_floor_then_resets() {
        let dir = tempfile::tempdir().unwrap();
        write_candidates(
            dir.path(),
            &["Svc::conn\t7\t100000\tNullToNonNull\tSvc::Init\t12\t1\t1\t170000\tUse\tSvc::Run\t30\t2\t1"],
        );
        let sched = DelayScheduler::from_tables(&config_in(dir.path())).unwrap();

        let mut prev = 1.0;
        for _ in 0..10 {
            sched.decay("Svc::Init|12");
            let p = sched.snapshot_probabilities()["Svc::Init|12"];
            assert!(p <= prev);
            prev = p;
        }
        assert_eq!(prev, 0.001);
        sched.decay("Svc::Init|12");
        assert_eq!(sched.snapshot_probabilities()["Svc::Init|12"], 1.0);
    }

    #[test]
    fn foreign_conflicting_access_confirms_a_parked_delay() {
        let dir = tempfile::tempdir().unwrap();
        write_candidates(
            dir.path(),
            &["Svc::conn\t7\t100000\tNullToNonNull\tSvc::Init\t12\t1\t1\t170000\tUse\tSvc::Run\t30\t2\t1"],
        );
        let sched = Arc::new(DelayScheduler::from_tables(&config_in(dir.path())).unwrap());

        let parked = Arc::clone(&sched);
        let handle = std::thread::spawn(move || {
            parked.try_to_delay("Svc::Init|12", "a1@Svc::conn", InjectionPoint::BeforeWrite, 1, 0)
        });
        // wait until the delay is registered
        while sched.lock_active().is_empty() {
            std::thread::yield_now();
        }
        sched.note_access("a1@Svc::conn", "Svc::Run|30", AccessKind::Use, 2, 1000);

        let outcome = handle.join().unwrap().unwrap();
        assert!(outcome.confirmed);
        assert_eq!(sched.confirmed_count(), 1);
        assert_eq!(sched.order_violations()[0].conflicting_site, "Svc::Run|30");
        // a confirmed delay keeps its probability
        assert_eq!(sched.snapshot_probabilities()["Svc::Init|12"], 1.0);
    }

    #[test]
    fn same_thread_or_wrong_kind_never_confirms() {
        let dir = tempfile::tempdir().unwrap();
        write_candidates(
            dir.path(),
            &["Svc::conn\t7\t100000\tNullToNonNull\tSvc::Init\t12\t1\t1\t170000\tUse\tSvc::Run\t30\t2\t1"],
        );
        let sched = DelayScheduler::from_tables(&config_in(dir.path())).unwrap();

        let confirmed = Arc::new(AtomicBool::new(false));
        sched.lock_active().push(ActiveDelay {
            site: "Svc::Init|12".to_string(),
            memory_id: "a1@Svc::conn".to_string(),
            thread_id: 1,
            clock: vclock::current(),
            point: InjectionPoint::BeforeWrite,
            confirmed: Arc::clone(&confirmed),
            conflicting_site: Arc::new(Mutex::new(String::new())),
        });

        // same thread
        sched.note_access("a1@Svc::conn", "Svc::Run|30", AccessKind::Use, 1, 0);
        assert!(!confirmed.load(Ordering::Acquire));
        // conflicting kind but unknown pair
        sched.note_access("a1@Svc::conn", "Elsewhere::Go|2", AccessKind::Use, 2, 0);
        assert!(!confirmed.load(Ordering::Acquire));
        // write is not read-like
        sched.note_access("a1@Svc::conn", "Svc::Run|30", AccessKind::Write, 2, 0);
        assert!(!confirmed.load(Ordering::Acquire));
    }

    #[test]
    fn conflicting_access_just_after_a_delay_counts_as_late_violation() {
        let dir = tempfile::tempdir().unwrap();
        write_candidates(
            dir.path(),
            &["Svc::conn\t7\t100000\tNullToNonNull\tSvc::Init\t12\t1\t1\t170000\tUse\tSvc::Run\t30\t2\t1"],
        );
        let sched = DelayScheduler::from_tables(&config_in(dir.path())).unwrap();

        sched.lock_recent().push_back(RecentDelay {
            site: "Svc::Init|12".to_string(),
            memory_id: "a1@Svc::conn".to_string(),
            thread_id: 1,
            clock: vclock::current(),
            point: InjectionPoint::BeforeWrite,
            end_ticks: 100_000,
        });

        // 3 ms after the delay ended, inside the near-miss window
        sched.note_access("a1@Svc::conn", "Svc::Run|30", AccessKind::Use, 2, 130_000);
        assert_eq!(sched.late_confirmed_count(), 1);
        assert_eq!(sched.order_violations().len(), 1);
        // the matched entry is consumed
        assert!(sched.lock_recent().is_empty());
    }

    #[test]
    fn fork_ordered_access_never_confirms() {
        let dir = tempfile::tempdir().unwrap();
        write_candidates(
            dir.path(),
            &["Svc::conn\t7\t100000\tNullToNonNull\tSvc::Init\t12\t1\t1\t170000\tUse\tSvc::Run\t30\t2\t1"],
        );
        let sched = DelayScheduler::from_tables(&config_in(dir.path())).unwrap();

        // forking makes this thread a causal descendant of its old clock
        let pre_fork_clock = vclock::current();
        let _child = vclock::fork();

        let confirmed = Arc::new(AtomicBool::new(false));
        sched.lock_active().push(ActiveDelay {
            site: "Svc::Init|12".to_string(),
            memory_id: "a1@Svc::conn".to_string(),
            thread_id: 1,
            clock: pre_fork_clock.clone(),
            point: InjectionPoint::BeforeWrite,
            confirmed: Arc::clone(&confirmed),
            conflicting_site: Arc::new(Mutex::new(String::new())),
        });
        sched.note_access("a1@Svc::conn", "Svc::Run|30", AccessKind::Use, 2, 1000);
        assert!(!confirmed.load(Ordering::Acquire));

        sched.lock_recent().push_back(RecentDelay {
            site: "Svc::Init|12".to_string(),
            memory_id: "a1@Svc::conn".to_string(),
            thread_id: 1,
            clock: pre_fork_clock,
            point: InjectionPoint::BeforeWrite,
            end_ticks: 0,
        });
        sched.note_access("a1@Svc::conn", "Svc::Run|30", AccessKind::Use, 2, 1000);
        assert_eq!(sched.late_confirmed_count(), 0);
        // the entry stays queued for a genuinely concurrent access
        assert_eq!(sched.lock_recent().len(), 1);
    }

    #[test]
    fn floor_probabilities_reset_on_load() {
        let dir = tempfile::tempdir().unwrap();
        write_candidates(
            dir.path(),
            &["Svc::conn\t7\t100000\tNullToNonNull\tSvc::Init\t12\t1\t1\t170000\tUse\tSvc::Run\t30\t2\t1"],
        );
        let mut probs = HashMap::new();
        probs.insert("Svc::Init|12".to_string(), 0.001_f64);
        storage::write_probabilities(&dir.path().join("Probs.wfl"), &probs).unwrap();

        let sched = DelayScheduler::from_tables(&config_in(dir.path())).unwrap();
        assert_eq!(sched.snapshot_probabilities()["Svc::Init|12"], 1.0);
    }
}
