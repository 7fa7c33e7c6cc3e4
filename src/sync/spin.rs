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

//! Mutually exclusive access primitive based on a spinlock.
//!
//! A [`Spin`] protects its wrapped data from being accessed concurrently,
//! avoiding data races.
//!
//! One particularity of kernel development is that multi-threading is not
//! the only source of concurrency issues: an interrupt may be triggered at
//! any moment. For this reason, spinlocks in the kernel are equipped with an
//! option allowing to disable interrupts for the duration of the lock.

use super::interrupt_control;
use core::{
	cell::UnsafeCell,
	fmt::{self, Formatter},
	hint,
	ops::{Deref, DerefMut},
	sync::atomic::{AtomicBool, Ordering::Acquire, Ordering::Release},
};

#[inline(always)]
fn lock_bool(lock: &AtomicBool) {
	while lock.swap(true, Acquire) {
		hint::spin_loop();
	}
}

/// Unlocks the associated [`Spin`] when dropped.
pub struct SpinGuard<'m, T: ?Sized, const INT: bool> {
	spin: &'m Spin<T, INT>,
	/// The interrupt state before locking. Relevant only if `INT == false`.
	int_state: bool,
}

impl<T: ?Sized, const INT: bool> Deref for SpinGuard<'_, T, INT> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		unsafe { &*self.spin.data.get() }
	}
}

impl<T: ?Sized, const INT: bool> DerefMut for SpinGuard<'_, T, INT> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		unsafe { &mut *self.spin.data.get() }
	}
}

impl<T: ?Sized + fmt::Debug, const INT: bool> fmt::Debug for SpinGuard<'_, T, INT> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self.deref(), f)
	}
}

impl<T: ?Sized, const INT: bool> Drop for SpinGuard<'_, T, INT> {
	fn drop(&mut self) {
		unsafe {
			self.spin.unlock(self.int_state);
		}
	}
}

/// Wraps a value accessed by only one context at a time.
///
/// `INT` tells whether interrupts are allowed while locked; the default is
/// `true` (a plain spinlock). `IntSpin` (`INT = false`) additionally
/// disables interrupts for the critical section's duration, for state read
/// by the interrupt handler itself (the ready queue, donation bookkeeping).
pub struct Spin<T: ?Sized, const INT: bool = true> {
	lock: AtomicBool,
	data: UnsafeCell<T>,
}

impl<T, const INT: bool> Spin<T, INT> {
	/// Creates a new instance wrapping `data`.
	pub const fn new(data: T) -> Self {
		Self {
			lock: AtomicBool::new(false),
			data: UnsafeCell::new(data),
		}
	}
}

impl<T: ?Sized, const INT: bool> Spin<T, INT> {
	/// Acquires the spinlock, spinning until it becomes available.
	pub fn lock(&self) -> SpinGuard<T, INT> {
		let int_state = if !INT {
			let ctrl = interrupt_control();
			ctrl.disable()
		} else {
			false
		};
		lock_bool(&self.lock);
		SpinGuard {
			spin: self,
			int_state,
		}
	}

	/// Releases the spinlock.
	///
	/// # Safety
	///
	/// Must only be called once per successful `lock`, by the thread that
	/// holds it. Called automatically when the guard is dropped.
	unsafe fn unlock(&self, int_state: bool) {
		self.lock.store(false, Release);
		if !INT && int_state {
			interrupt_control().restore(int_state);
		}
	}
}

unsafe impl<T: ?Sized, const INT: bool> Sync for Spin<T, INT> {}

impl<T: ?Sized + fmt::Debug, const INT: bool> fmt::Debug for Spin<T, INT> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(&*self.lock(), f)
	}
}

/// A [`Spin`] that disables interrupts while locked.
pub type IntSpin<T> = Spin<T, false>;
/// Guard of an [`IntSpin`].
pub type IntSpinGuard<'m, T> = SpinGuard<'m, T, false>;

#[cfg(test)]
mod test {
	use super::*;
	use crate::sync::test_support::ensure_init;

	#[test]
	fn basic_exclusion() {
		let s = Spin::<u32>::new(0);
		{
			let mut g = s.lock();
			*g += 1;
		}
		assert_eq!(*s.lock(), 1);
	}

	#[test]
	fn int_spin_restores_interrupt_state() {
		ensure_init();
		let s = IntSpin::new(0);
		{
			let mut g = s.lock();
			*g = 42;
		}
		assert_eq!(*s.lock(), 42);
	}
}
