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

//! Sleeping mutual exclusion primitive.
//!
//! Contrary to [`super::spin::Spin`], [`Mutex`] puts the current thread to
//! sleep while waiting instead of spinning, for the global tables that may
//! be held across block I/O (`spec.md` §5: frame table, shared table, swap,
//! per-frame owners list, filesystem). Grounded on `kernel/src/sync/
//! mutex.rs`, minus the teacher's `INT` (signal-interruptible) variant —
//! this core has no signal delivery to interrupt a wait with.

use crate::{
	scheduler,
	sync::spin::IntSpin,
	thread::{State, Thread},
};
use alloc::{collections::VecDeque, sync::Arc};
use core::{
	cell::UnsafeCell,
	fmt,
	fmt::Formatter,
	ops::{Deref, DerefMut},
};

struct Queue {
	/// Number of threads that have entered the critical section's queue
	/// (held + waiting). The thread that takes it from `0` to `1` owns the
	/// mutex uncontended; everyone else sleeps.
	acquired: usize,
	waiters: VecDeque<Arc<Thread>>,
}

fn lock_slow(queue: &IntSpin<Queue>) {
	{
		let mut q = queue.lock();
		q.acquired += 1;
		if q.acquired == 1 {
			return;
		}
		let me = Thread::current();
		q.waiters.push_back(me.clone());
		me.set_state(State::Blocked);
	}
	scheduler::schedule();
}

fn unlock_slow(queue: &IntSpin<Queue>) {
	let next = {
		let mut q = queue.lock();
		q.acquired -= 1;
		q.waiters.pop_front()
	};
	if let Some(next) = next {
		scheduler::unblock(next);
	}
}

/// Unlocks the associated [`Mutex`] when dropped.
pub struct MutexGuard<'m, T: ?Sized> {
	mutex: &'m Mutex<T>,
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		unsafe { &*self.mutex.data.get() }
	}
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		unsafe { &mut *self.mutex.data.get() }
	}
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self.deref(), f)
	}
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
	fn drop(&mut self) {
		unlock_slow(&self.mutex.queue);
	}
}

/// A sleeping mutex.
pub struct Mutex<T: ?Sized> {
	queue: IntSpin<Queue>,
	data: UnsafeCell<T>,
}

impl<T> Mutex<T> {
	/// Creates a new instance wrapping `data`.
	pub const fn new(data: T) -> Self {
		Self {
			queue: IntSpin::new(Queue {
				acquired: 0,
				waiters: VecDeque::new(),
			}),
			data: UnsafeCell::new(data),
		}
	}
}

impl<T: ?Sized> Mutex<T> {
	/// Acquires the mutex, sleeping if it is already held.
	pub fn lock(&self) -> MutexGuard<T> {
		lock_slow(&self.queue);
		MutexGuard {
			mutex: self,
		}
	}
}

unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

#[cfg(test)]
mod test {
	use super::*;
	use crate::scheduler::{self as sched, Mode};

	#[test]
	fn uncontended_lock_unlock() {
		sched::test_support::with_scheduler(Mode::Priority, || {
			let m = Mutex::new(0);
			{
				let mut g = m.lock();
				*g += 1;
			}
			assert_eq!(*m.lock(), 1);
		});
	}
}
