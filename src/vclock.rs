// SPDX-License-Identifier: MIT

//! Happens-before tracking via per-context logical clocks
//!
//! Each execution context (thread or task) carries a '.'-joined counter path.
//! A child forked through [`fork`] is prefixed by its parent's path, and the
//! parent bumps its own path so concurrent siblings get distinct tags. Two
//! contexts are causally related iff one path is a string prefix of the
//! other.
//!
//! This only captures parent→child propagation through code that actually
//! calls [`fork`]/[`adopt`]; siblings ordered by an out-of-band mechanism are
//! still reported as unrelated. That soundness gap is a known property of the
//! approximation, not something to repair here.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};

/// Clock value meaning "tracking disabled / unknown".
pub const NO_CLOCK: &str = "0";

thread_local! {
    static CLOCK: RefCell<Option<String>> = const { RefCell::new(None) };
    static THREAD_IDENT: RefCell<Option<u32>> = const { RefCell::new(None) };
    static TASK_IDENT: RefCell<u64> = const { RefCell::new(0) };
}

static NEXT_THREAD_IDENT: AtomicU32 = AtomicU32::new(1);

/// A clock token handed from a forking parent to the context it spawns.
#[derive(Debug, Clone)]
pub struct ChildClock(String);

/// The calling context's clock, lazily initialized to `"1"` on first use.
///
/// The read path is thread-local and takes no lock; only [`fork`] mutates
/// state, and it runs on the owning thread.
pub fn current() -> String {
    CLOCK.with(|c| {
        let mut clock = c.borrow_mut();
        clock.get_or_insert_with(|| "1".to_string()).clone()
    })
}

/// Forks the calling context's clock for a child it is about to spawn.
///
/// The child's clock is the parent's path extended with a fresh `"1"`; the
/// parent's own path grows a `".0"` generation marker so the next sibling
/// forks under a distinct prefix.
pub fn fork() -> ChildClock {
    CLOCK.with(|c| {
        let mut clock = c.borrow_mut();
        let parent = clock.get_or_insert_with(|| "1".to_string());
        let child = format!("{parent}.1");
        parent.push_str(".0");
        ChildClock(child)
    })
}

/// Installs a forked clock on the calling (child) context.
pub fn adopt(child: ChildClock) {
    CLOCK.with(|c| {
        *c.borrow_mut() = Some(child.0);
    });
}

/// True iff one clock path causally precedes the other (prefix test in
/// either direction). The sentinel [`NO_CLOCK`] and empty strings carry no
/// ordering information and never relate.
pub fn is_ancestor(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() || a == NO_CLOCK || b == NO_CLOCK {
        return false;
    }
    a.starts_with(b) || b.starts_with(a)
}

/// Dense id assigned to the calling thread the first time it is observed.
pub fn thread_ident() -> u32 {
    THREAD_IDENT.with(|t| {
        let mut ident = t.borrow_mut();
        *ident.get_or_insert_with(|| NEXT_THREAD_IDENT.fetch_add(1, Ordering::Relaxed))
    })
}

/// Task id of the calling context; zero when no task is active.
pub fn task_ident() -> u64 {
    TASK_IDENT.with(|t| *t.borrow())
}

/// Marks the calling context as executing the given task. The
/// instrumentation layer calls this at task entry/exit; zero clears it.
pub fn set_task_ident(task_id: u64) {
    TASK_IDENT.with(|t| *t.borrow_mut() = task_id);
}
