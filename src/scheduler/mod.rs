/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! Ready queue, priority selection, preemption, and the MLFQS scheduler
//! (`spec.md` §4.8, §9).
//!
//! Real context switching — saving and restoring a thread's register file
//! and kernel stack — is interrupt-dispatch plumbing out of this core's
//! scope (`spec.md` §1), the way `kernel/src/process/scheduler/switch.rs`
//! is kept separate from `Scheduler::tick` in the teacher. This module owns
//! only the *decision* of which thread runs next and the bookkeeping (ready
//! queue membership, quantum counters, MLFQS statistics) that decision
//! depends on; by the time [`schedule`] returns, [`current_thread`]
//! reflects the new owner, and the embedding kernel performs the actual
//! stack swap.

use crate::{
	config,
	fixed_point::Fixed,
	sync::{once::OnceInit, spin::IntSpin},
	thread::{State, Thread, Tid},
};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};

/// Scheduling policy selected at boot (`-mlfqs`, `spec.md` §6).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
	/// Strict priority scan with donation.
	Priority,
	/// Multilevel feedback queue; donation is disabled in this mode.
	Mlfqs,
}

/// A single logical CPU's scheduler: one ready queue, one current thread.
///
/// `spec.md` is explicit that SMP is a non-goal (§1), so there is exactly
/// one of these per kernel.
pub struct Scheduler {
	mode: Mode,
	/// Every thread registered with this scheduler, for MLFQS statistics
	/// that must visit blocked threads too.
	threads: BTreeMap<Tid, Arc<Thread>>,
	/// Ready threads, in insertion order (the order ties break by).
	ready: Vec<Arc<Thread>>,
	current: Arc<Thread>,
	/// Run when `ready` is empty and `current` has nothing left to do.
	idle: Arc<Thread>,
	total_ticks: u64,
	/// MLFQS load average, fixed-point.
	load_avg: Fixed,
}

impl Scheduler {
	fn new(mode: Mode, idle: Arc<Thread>) -> Self {
		Self {
			mode,
			threads: BTreeMap::new(),
			ready: Vec::new(),
			current: idle.clone(),
			idle,
			total_ticks: 0,
			load_avg: Fixed::ZERO,
		}
	}

	/// Removes and returns the ready thread with the highest effective
	/// priority, breaking ties by earliest insertion (`spec.md` §4.8).
	/// Falls back to the idle thread when `ready` is empty.
	fn pick_next(&mut self) -> Arc<Thread> {
		if self.ready.is_empty() {
			return self.idle.clone();
		}
		let mut best = 0;
		for i in 1..self.ready.len() {
			if self.ready[i].effective_priority() > self.ready[best].effective_priority() {
				best = i;
			}
		}
		self.ready.remove(best)
	}

	/// Number of threads counted toward `load_avg`: the ready queue, plus
	/// the current thread unless it is the idle thread (`spec.md` §4.8).
	fn ready_count(&self) -> usize {
		self.ready.len() + usize::from(!Arc::ptr_eq(&self.current, &self.idle))
	}
}

#[cfg(not(test))]
static SCHEDULER: OnceInit<IntSpin<Scheduler>> = unsafe { OnceInit::new() };

#[cfg(not(test))]
fn handle() -> &'static IntSpin<Scheduler> {
	&SCHEDULER
}

#[cfg(test)]
fn handle() -> &'static IntSpin<Scheduler> {
	test_support::handle()
}

/// Initializes the scheduler with the given mode and idle thread.
///
/// Must be called exactly once, before any other function in this module.
#[cfg(not(test))]
pub fn init(mode: Mode, idle: Arc<Thread>) {
	unsafe {
		OnceInit::init(&SCHEDULER, IntSpin::new(Scheduler::new(mode, idle)));
	}
}

/// Registers a newly created thread with the scheduler.
pub fn register(t: Arc<Thread>) {
	let mut s = handle().lock();
	s.threads.insert(t.tid, t.clone());
	if t.state() == State::Ready {
		s.ready.push(t);
	}
}

/// Removes a thread from the scheduler, e.g. once it has been reaped after
/// `Dying`.
pub fn remove(tid: Tid) {
	let mut s = handle().lock();
	s.threads.remove(&tid);
	s.ready.retain(|t| t.tid != tid);
}

/// Returns the thread currently running on this core.
pub fn current_thread() -> Arc<Thread> {
	handle().lock().current.clone()
}

/// Moves `t` to `Ready` and enqueues it, preempting the current thread
/// immediately if `t` now outranks it (`spec.md` §4.8: "`thread_unblock` of
/// a higher-priority thread causes the current thread to yield
/// immediately"). No-op in MLFQS mode, where priority alone never triggers
/// preemption outside the tick-driven recompute.
pub fn unblock(t: Arc<Thread>) {
	let should_preempt = {
		let mut s = handle().lock();
		t.set_state(State::Ready);
		let preempt = s.mode == Mode::Priority
			&& !Arc::ptr_eq(&s.current, &s.idle)
			&& t.effective_priority() > s.current.effective_priority();
		s.ready.push(t);
		preempt
	};
	if should_preempt {
		schedule();
	}
}

/// Picks the next thread to run and switches `current` to it.
///
/// If the calling thread is still `Running` (a voluntary yield), it is
/// requeued; if it has already been marked `Blocked` or `Dying` by the
/// caller, it is left off the ready queue. A no-op if the winner is already
/// current.
pub fn schedule() {
	let mut s = handle().lock();
	let next = s.pick_next();
	if Arc::ptr_eq(&next, &s.current) {
		return;
	}
	let prev = core::mem::replace(&mut s.current, next.clone());
	if prev.state() == State::Running && !Arc::ptr_eq(&prev, &s.idle) {
		prev.set_state(State::Ready);
		s.ready.push(prev);
	}
	next.set_state(State::Running);
}

/// Sets the current thread's base priority, yielding if some ready thread
/// now outranks it (`spec.md` §8 law: `get_priority()` afterwards returns
/// `max(new, max donor priority)`, not `new`).
pub fn set_priority(new: u8) -> u8 {
	let current = current_thread();
	let eff = current.set_base_priority(new);
	let should_yield = {
		let s = handle().lock();
		s.ready.iter().any(|t| t.effective_priority() > eff)
	};
	if should_yield {
		schedule();
	}
	eff
}

fn recompute_mlfqs_priority(t: &Arc<Thread>) {
	let recent_cpu = *t.recent_cpu.lock();
	let nice = i32::from(*t.nice.lock());
	let p = i32::from(config::PRI_MAX) - recent_cpu.div_int(4).to_int_trunc() - nice * 2;
	let p = p.clamp(i32::from(config::PRI_MIN), i32::from(config::PRI_MAX)) as u8;
	t.set_base_priority(p);
}

/// Advances the scheduler by one timer tick. Returns whether the caller
/// should request a deferred yield at interrupt-return time (`spec.md`
/// §4.8); this module never switches context from inside an interrupt
/// handler itself (§5: "Interrupt context MUST NOT suspend").
pub fn tick() -> bool {
	let mut s = handle().lock();
	s.total_ticks += 1;
	if s.mode == Mode::Mlfqs {
		if !Arc::ptr_eq(&s.current, &s.idle) {
			let mut rc = s.current.recent_cpu.lock();
			*rc = *rc + Fixed::from_int(1);
		}
		if s.total_ticks % u64::from(config::TIMER_FREQ) == 0 {
			let ready_count = s.ready_count() as i32;
			let coef_old = Fixed::from_int(59).div_int(60);
			let coef_new = Fixed::from_int(1).div_int(60);
			s.load_avg = coef_old * s.load_avg + coef_new * Fixed::from_int(ready_count);
			let two_load = s.load_avg.mul_int(2);
			let decay = two_load / (two_load + Fixed::from_int(1));
			for t in s.threads.values() {
				let mut rc = t.recent_cpu.lock();
				let nice = Fixed::from_int(i32::from(*t.nice.lock()));
				*rc = decay * *rc + nice;
			}
		}
		if s.total_ticks % 4 == 0 {
			let current = s.current.clone();
			recompute_mlfqs_priority(&current);
			for t in s.ready.clone() {
				recompute_mlfqs_priority(&t);
			}
		}
	}
	if !Arc::ptr_eq(&s.current, &s.idle) {
		let mut qt = s.current.quantum_ticks.lock();
		*qt += 1;
		if *qt >= config::TIME_SLICE {
			*qt = 0;
			return true;
		}
	}
	false
}

/// Returns the current MLFQS load average, for diagnostics/tests.
pub fn load_avg() -> Fixed {
	handle().lock().load_avg
}

#[cfg(test)]
pub(crate) mod test_support {
	use super::*;
	use alloc::boxed::Box;
	use std::cell::Cell;

	thread_local! {
		static CURRENT: Cell<Option<&'static IntSpin<Scheduler>>> = const { Cell::new(None) };
	}

	/// Each hosted test gets its own leaked scheduler bound to the calling
	/// test thread, so that `cargo test`'s default parallel execution
	/// doesn't race on a single global. A small per-test leak is an
	/// acceptable trade in a hosted test harness that never runs on real
	/// kernel hardware.
	pub(crate) fn handle() -> &'static IntSpin<Scheduler> {
		CURRENT.with(|c| {
			c.get()
				.expect("call within `scheduler::test_support::with_scheduler`")
		})
	}

	pub(crate) fn with_scheduler<R>(mode: Mode, body: impl FnOnce() -> R) -> R {
		let idle = Thread::new(0, "idle", config::PRI_MIN);
		let sched: &'static IntSpin<Scheduler> =
			Box::leak(Box::new(IntSpin::new(Scheduler::new(mode, idle))));
		CURRENT.with(|c| c.set(Some(sched)));
		body()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use test_support::with_scheduler;

	fn spawn(tid: Tid, name: &'static str, priority: u8) -> Arc<Thread> {
		let t = Thread::new(tid, name, priority);
		register(t.clone());
		t
	}

	#[test]
	fn higher_priority_ready_thread_wins() {
		with_scheduler(Mode::Priority, || {
			spawn(1, "low", 31);
			let high = spawn(2, "high", 40);
			schedule();
			assert_eq!(current_thread().tid, high.tid);
		});
	}

	#[test]
	fn ties_break_fifo() {
		with_scheduler(Mode::Priority, || {
			let first = spawn(1, "first", 31);
			spawn(2, "second", 31);
			schedule();
			assert_eq!(current_thread().tid, first.tid);
		});
	}

	#[test]
	fn unblock_preempts_when_higher_priority() {
		with_scheduler(Mode::Priority, || {
			let low = spawn(1, "low", 20);
			schedule();
			assert_eq!(current_thread().tid, low.tid);
			let high = Thread::new(2, "high", 50);
			unblock(high.clone());
			assert_eq!(current_thread().tid, high.tid);
		});
	}

	#[test]
	fn set_priority_yields_when_outranked() {
		with_scheduler(Mode::Priority, || {
			let me = spawn(1, "me", 20);
			schedule();
			assert_eq!(current_thread().tid, me.tid);
			spawn(2, "other", 30);
			set_priority(25);
			assert_eq!(current_thread().tid, 2);
		});
	}

	#[test]
	fn mlfqs_load_avg_rises_with_one_busy_thread() {
		with_scheduler(Mode::Mlfqs, || {
			let t = spawn(1, "busy", config::PRI_DEFAULT);
			t.set_state(State::Ready);
			schedule();
			assert_eq!(current_thread().tid, t.tid);
			for _ in 0..config::TIMER_FREQ {
				tick();
			}
			// One running thread: load_avg should have moved up from zero.
			assert!(load_avg() > Fixed::ZERO);
		});
	}
}
