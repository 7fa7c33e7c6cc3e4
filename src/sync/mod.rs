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

//! Kernel-internal synchronization primitives protecting the core's own
//! data structures (frame table, swap bitmap, shared table, scheduler
//! state).
//!
//! These are distinct from [`crate::thread::sync_prim`], which implements
//! the user-visible semaphore/lock/condition variable with priority
//! donation. Nothing in this module participates in donation; it exists
//! purely to keep kernel tables internally consistent.

pub mod atomic;
pub mod mutex;
pub mod once;
pub mod spin;
pub mod wait_queue;

use crate::device::InterruptControl;
use once::OnceInit;

/// The interrupt-control hook for this core.
///
/// Set once at boot by [`set_interrupt_control`]. [`spin::IntSpin`] uses it
/// to disable interrupts for the duration of its critical sections.
static INTERRUPT_CONTROL: OnceInit<&'static dyn InterruptControl> = unsafe { OnceInit::new() };

/// Installs the interrupt-control implementation used by [`spin::IntSpin`].
///
/// # Safety
///
/// Must be called exactly once, before any [`spin::IntSpin`] is locked.
pub unsafe fn set_interrupt_control(ctrl: &'static dyn InterruptControl) {
	unsafe {
		OnceInit::init(&INTERRUPT_CONTROL, ctrl);
	}
}

fn interrupt_control() -> &'static dyn InterruptControl {
	*INTERRUPT_CONTROL
}

#[cfg(test)]
pub(crate) mod test_support {
	use crate::device::InterruptControl;
	use core::cell::Cell;

	/// A single-core-single-thread interrupt control stand-in for tests.
	pub struct TestInterruptControl(Cell<bool>);

	// SAFETY: the test harness is single-threaded.
	unsafe impl Sync for TestInterruptControl {}

	impl TestInterruptControl {
		pub const fn new() -> Self {
			Self(Cell::new(true))
		}
	}

	impl InterruptControl for TestInterruptControl {
		fn is_enabled(&self) -> bool {
			self.0.get()
		}

		fn disable(&self) -> bool {
			self.0.replace(false)
		}

		fn restore(&self, prev: bool) {
			self.0.set(prev);
		}
	}

	pub static TEST_INT_CTRL: TestInterruptControl = TestInterruptControl::new();

	/// Ensures [`super::set_interrupt_control`] has been called, for tests
	/// that exercise [`super::spin::IntSpin`] directly.
	pub fn ensure_init() {
		use std::sync::Once;
		static ONCE: Once = Once::new();
		ONCE.call_once(|| unsafe {
			super::set_interrupt_control(&TEST_INT_CTRL);
		});
	}
}
