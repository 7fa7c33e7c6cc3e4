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

//! FIFO queue of threads waiting on a kernel-internal resource, grounded on
//! `kernel/src/sync/wait_queue.rs`.
//!
//! Unlike [`crate::thread::sync_prim::Semaphore`], threads parked here carry
//! no donation: this is for kernel bookkeeping (e.g. the timer tick list a
//! block-device completion wakes), not user-visible contention.

use crate::{
	scheduler,
	sync::spin::IntSpin,
	thread::{State, Thread},
};
use alloc::{collections::VecDeque, sync::Arc};

/// A FIFO queue of blocked threads.
pub struct WaitQueue(IntSpin<VecDeque<Arc<Thread>>>);

impl Default for WaitQueue {
	fn default() -> Self {
		Self::new()
	}
}

impl WaitQueue {
	/// Creates a new, empty queue.
	pub const fn new() -> Self {
		Self(IntSpin::new(VecDeque::new()))
	}

	/// Parks the current thread on this queue until woken by
	/// [`Self::wake_next`] or [`Self::wake_all`].
	pub fn wait(&self) {
		let me = Thread::current();
		self.0.lock().push_back(me.clone());
		me.set_state(State::Blocked);
		scheduler::schedule();
	}

	/// Wakes the longest-waiting thread, if any.
	pub fn wake_next(&self) {
		if let Some(t) = self.0.lock().pop_front() {
			scheduler::unblock(t);
		}
	}

	/// Wakes every waiting thread.
	pub fn wake_all(&self) {
		let waiters = core::mem::take(&mut *self.0.lock());
		for t in waiters {
			scheduler::unblock(t);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::scheduler::{self as sched, Mode};

	#[test]
	fn wake_next_resumes_one_waiter() {
		sched::test_support::with_scheduler(Mode::Priority, || {
			let wq = WaitQueue::new();
			let waiter = Thread::new(5, "waiter", 31);
			waiter.set_state(State::Blocked);
			wq.0.lock().push_back(waiter.clone());
			wq.wake_next();
			assert_eq!(waiter.state(), State::Ready);
		});
	}
}
