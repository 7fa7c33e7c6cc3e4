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

//! Thread identity and state, and the priority donation that rides on top of
//! [`sync_prim::Lock`] ownership chains.
//!
//! A thread's effective priority is always `max(base, max donor effective
//! priority)`, recomputed transitively through every lock it holds
//! (`spec.md` §3, invariant 5). This module keeps that invariant by
//! updating the cached effective priority incrementally on donate/revoke
//! rather than recomputing the whole chain from scratch on every read.

pub mod sync_prim;

use crate::{
	config,
	sync::spin::IntSpin,
	vm::{mmap::MmapTable, spt::SupplementalPageTable},
};
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU8, Ordering};

/// A process-wide unique thread id.
pub type Tid = u32;

/// The state of a thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
	/// Currently executing on the core.
	Running,
	/// Runnable, waiting for the scheduler to pick it.
	Ready,
	/// Waiting on a semaphore, lock, condition variable, or I/O.
	Blocked,
	/// Exiting; will be reaped by the scheduler on its next tail.
	Dying,
}

/// A single donation: `donor` is lending its effective priority through the
/// lock identified by `lock_id`, so that on release the donation can be
/// found and re-homed (or dropped) in O(donors-on-that-lock) instead of a
/// full graph walk.
struct Donation {
	donor: Arc<Thread>,
	lock_id: usize,
}

/// The record of a child process's completion, shared between parent and
/// child so that whichever of the two exits last frees it (`spec.md` §9,
/// Open Questions).
#[derive(Default)]
pub struct ChildLink {
	exit_status: IntSpin<Option<i32>>,
	/// Set once by whichever side (parent waiting, or child exiting) finds
	/// the other side already gone.
	both_gone: IntSpin<bool>,
}

impl ChildLink {
	/// Records the child's exit status, visible to a waiting parent.
	pub fn set_exit_status(&self, status: i32) {
		*self.exit_status.lock() = Some(status);
	}

	/// Returns the exit status, if the child has exited.
	pub fn exit_status(&self) -> Option<i32> {
		*self.exit_status.lock()
	}

	/// Called by either side when it is done with this record. Returns
	/// `true` for the side that observes the other has already let go,
	/// meaning it is responsible for freeing the shared record.
	pub fn release(&self) -> bool {
		let mut gone = self.both_gone.lock();
		if *gone {
			true
		} else {
			*gone = true;
			false
		}
	}
}

/// A schedulable thread.
///
/// Combines what `spec.md` §3 calls "Thread": scheduling identity and state,
/// priority donation bookkeeping, and the root of its address space.
pub struct Thread {
	/// Process-wide unique id.
	pub tid: Tid,
	/// Human-readable name, for debugging.
	pub name: &'static str,

	state: IntSpin<State>,
	/// Base priority, set by `set_priority` or at creation. In `[0, 63]`.
	base_priority: AtomicU8,
	/// Cached effective priority: `max(base, max donor effective priority)`.
	effective_priority: AtomicU8,
	/// Niceness, in `[-20, 20]`, used only in MLFQS mode.
	pub nice: IntSpin<i8>,
	/// `recent_cpu`, fixed-point, used only in MLFQS mode.
	pub recent_cpu: IntSpin<crate::fixed_point::Fixed>,

	/// Threads currently donating to this one through locks it holds.
	donors: IntSpin<Vec<Donation>>,
	/// Identity of the lock this thread is blocked on, if any. Used to
	/// propagate donation transitively when the holder is itself blocked.
	waiting_on_lock: IntSpin<Option<usize>>,

	/// Root of this thread's address space.
	pub spt: Arc<SupplementalPageTable>,
	/// This process's `mmap` mapping-id table.
	pub mmap_table: MmapTable,

	/// Number of ticks run in the current time slice.
	pub quantum_ticks: IntSpin<u64>,
	/// Number of stack pages currently allocated to this thread, capped at
	/// `spec.md`'s `MAX_STACK_PAGES`.
	pub stack_pages: IntSpin<usize>,
	/// The user stack pointer recorded at the last page fault, used by
	/// `ft_pin`/`ft_unpin` to grow the stack before pinning a range.
	pub last_user_sp: IntSpin<usize>,

	/// Parent-visible exit status and completion signal.
	pub child_link: Arc<ChildLink>,
}

impl Thread {
	/// Creates a new thread with the given base priority.
	///
	/// `tid` must be unique for the lifetime of the kernel; callers
	/// (typically the process-creation collaborator, out of this core's
	/// scope) are responsible for allocating it.
	pub fn new(tid: Tid, name: &'static str, base_priority: u8) -> Arc<Self> {
		let base_priority = base_priority.clamp(config::PRI_MIN, config::PRI_MAX);
		Arc::new(Self {
			tid,
			name,
			state: IntSpin::new(State::Ready),
			base_priority: AtomicU8::new(base_priority),
			effective_priority: AtomicU8::new(base_priority),
			nice: IntSpin::new(0),
			recent_cpu: IntSpin::new(crate::fixed_point::Fixed::ZERO),
			donors: IntSpin::new(Vec::new()),
			waiting_on_lock: IntSpin::new(None),
			spt: SupplementalPageTable::new(tid),
			mmap_table: MmapTable::new(),
			quantum_ticks: IntSpin::new(0),
			stack_pages: IntSpin::new(0),
			last_user_sp: IntSpin::new(0),
			child_link: Arc::new(ChildLink::default()),
		})
	}

	/// Returns the current thread, as tracked by the scheduler.
	pub fn current() -> Arc<Thread> {
		crate::scheduler::current_thread()
	}

	/// Returns the thread's current state.
	pub fn state(&self) -> State {
		*self.state.lock()
	}

	/// Sets the thread's state directly. Scheduling queue membership is the
	/// caller's (the scheduler's) responsibility.
	pub fn set_state(&self, state: State) {
		*self.state.lock() = state;
	}

	/// Returns the thread's base priority.
	pub fn base_priority(&self) -> u8 {
		self.base_priority.load(Ordering::Relaxed)
	}

	/// Returns the thread's effective priority: `max(base, max donor
	/// effective priority)`.
	pub fn effective_priority(&self) -> u8 {
		self.effective_priority.load(Ordering::Relaxed)
	}

	/// Sets the thread's base priority, then recomputes its effective
	/// priority as `max(new, max donor priority)` (`spec.md` §8 law).
	///
	/// Returns the resulting effective priority.
	pub fn set_base_priority(&self, new: u8) -> u8 {
		let new = new.clamp(config::PRI_MIN, config::PRI_MAX);
		self.base_priority.store(new, Ordering::Relaxed);
		self.recompute_effective_priority()
	}

	/// Recomputes and stores the effective priority from the current base
	/// and donor set, returning the new value.
	fn recompute_effective_priority(&self) -> u8 {
		let donors = self.donors.lock();
		let max_donor = donors
			.iter()
			.map(|d| d.donor.effective_priority())
			.max()
			.unwrap_or(0);
		let eff = self.base_priority().max(max_donor);
		self.effective_priority.store(eff, Ordering::Relaxed);
		eff
	}

	/// Identifies the lock this thread is currently blocked on, if any.
	pub fn waiting_on_lock(&self) -> Option<usize> {
		*self.waiting_on_lock.lock()
	}

	pub(crate) fn set_waiting_on_lock(&self, lock_id: Option<usize>) {
		*self.waiting_on_lock.lock() = lock_id;
	}

	/// Donates `donor`'s effective priority to `self` through the lock
	/// identified by `lock_id`, propagating transitively if `self` is
	/// itself blocked on another lock (nested donation, `spec.md` §4.8).
	pub(crate) fn receive_donation(self_arc: &Arc<Thread>, donor: Arc<Thread>, lock_id: usize) {
		self_arc.donors.lock().push(Donation {
			donor: donor.clone(),
			lock_id,
		});
		self_arc.recompute_effective_priority();
		// Propagate to whatever lock `self` is itself waiting on, so the
		// holder further up the chain also gets the elevated priority.
		if let Some(next_lock_id) = self_arc.waiting_on_lock() {
			if let Some(next_holder) = sync_prim::holder_of(next_lock_id) {
				if !Arc::ptr_eq(&next_holder, self_arc) {
					Thread::receive_donation(&next_holder, donor, next_lock_id);
				}
			}
		}
	}

	/// Removes every donation tagged with `lock_id` from this thread's
	/// donor list, returning the removed donors so the caller (releasing
	/// the lock) can re-home them onto the new owner.
	pub(crate) fn take_donations_for_lock(&self, lock_id: usize) -> Vec<Arc<Thread>> {
		let mut donors = self.donors.lock();
		let mut removed = Vec::new();
		donors.retain(|d| {
			if d.lock_id == lock_id {
				removed.push(d.donor.clone());
				false
			} else {
				true
			}
		});
		drop(donors);
		self.recompute_effective_priority();
		removed
	}

	/// Re-homes donations taken from a previous holder onto `self`, tagged
	/// with `lock_id` (the lock whose ownership just transferred).
	pub(crate) fn transfer_donations(self_arc: &Arc<Thread>, donors: Vec<Arc<Thread>>, lock_id: usize) {
		if donors.is_empty() {
			return;
		}
		let mut list = self_arc.donors.lock();
		list.extend(donors.into_iter().map(|donor| Donation { donor, lock_id }));
		drop(list);
		self_arc.recompute_effective_priority();
	}
}

impl Eq for Thread {}

impl PartialEq for Thread {
	fn eq(&self, other: &Self) -> bool {
		self.tid == other.tid
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn effective_priority_defaults_to_base() {
		let t = Thread::new(1, "t", 31);
		assert_eq!(t.base_priority(), 31);
		assert_eq!(t.effective_priority(), 31);
	}

	#[test]
	fn priority_is_clamped_to_spec_range() {
		let t = Thread::new(1, "t", 200);
		assert_eq!(t.base_priority(), config::PRI_MAX);
	}

	#[test]
	fn set_priority_accounts_for_donors() {
		let t = Thread::new(1, "t", 31);
		let donor = Thread::new(2, "donor", 40);
		Thread::receive_donation(&t, donor, 0xdead);
		assert_eq!(t.effective_priority(), 40);
		// Raising base above the donor wins.
		assert_eq!(t.set_base_priority(50), 50);
		// Lowering it back below the donor falls back to the donor's level.
		assert_eq!(t.set_base_priority(10), 40);
	}

	#[test]
	fn release_drops_only_that_locks_donors() {
		let t = Thread::new(1, "t", 31);
		let d1 = Thread::new(2, "d1", 40);
		let d2 = Thread::new(3, "d2", 35);
		Thread::receive_donation(&t, d1, 1);
		Thread::receive_donation(&t, d2, 2);
		assert_eq!(t.effective_priority(), 40);
		let removed = t.take_donations_for_lock(1);
		assert_eq!(removed.len(), 1);
		assert_eq!(t.effective_priority(), 35);
	}
}
