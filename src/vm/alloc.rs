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

//! User-page allocator glue (`spec.md` §4.7): hands the fault handler a
//! frame, evicting on exhaustion and retrying.
//!
//! `spec.md` is explicit that failure here is fatal to the calling
//! process; [`allocate_user_page`] surfaces that as [`Error::OutOfMemory`]
//! (if every retry still finds the table full, which given a correct
//! [`crate::vm::frame::evict_one`] should only happen when the frame table
//! has zero capacity) or whatever [`crate::vm::frame::evict_one`] itself
//! failed with (e.g. [`Error::AllPinned`]).

use crate::{
	config,
	error::KResult,
	vm::{FrameId, frame},
};

/// Bounds the evict-and-retry loop so a frame table that never frees up
/// (a bug elsewhere) fails loudly instead of spinning forever.
const MAX_EVICT_ATTEMPTS: usize = 64;

/// Materializes a frame filled with `fill`, evicting existing frames as
/// needed until one is free.
pub fn allocate_user_page(fill: [u8; config::PAGE_SIZE], writable: bool) -> KResult<FrameId> {
	for _ in 0..MAX_EVICT_ATTEMPTS {
		if frame::has_room() {
			return frame::insert(fill, writable);
		}
		frame::evict_one()?;
	}
	frame::insert(fill, writable)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::vm::{frame::test_support::with_frame_table, shared::test_support::with_shared_table};

	#[test]
	fn allocates_directly_when_room() {
		with_shared_table(|| {
			with_frame_table(2, || {
				let id = allocate_user_page([0; config::PAGE_SIZE], true).unwrap();
				assert!(frame::get(id).is_some());
			});
		});
	}

	#[test]
	fn evicts_when_full() {
		with_shared_table(|| {
			with_frame_table(1, || {
				let first = allocate_user_page([1; config::PAGE_SIZE], true).unwrap();
				let second = allocate_user_page([2; config::PAGE_SIZE], true).unwrap();
				// With no owners pinning `first`, eviction must have picked it,
				// freeing capacity for `second`.
				assert!(frame::get(first).is_none());
				assert!(frame::get(second).is_some());
			});
		});
	}
}
