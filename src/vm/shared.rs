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

//! The shared read-only file-page table: deduplicates identical
//! non-writable mappings of the same file range across processes
//! (`spec.md` §2 supplement, §4.3).
//!
//! Keyed on `(file identity, offset)` rather than a file pointer, since two
//! `FileHandle`s open on the same underlying file (two processes executing
//! the same binary) must dedup against each other; [`crate::device::
//! FileHandle::identity`] is the stable key half that makes this possible.

use crate::{sync::mutex::Mutex, vm::FrameId};
use alloc::collections::BTreeMap;

type Key = (u64, u64);

#[cfg(not(test))]
static SHARED_TABLE: crate::sync::once::OnceInit<Mutex<BTreeMap<Key, FrameId>>> =
	unsafe { crate::sync::once::OnceInit::new() };

#[cfg(not(test))]
pub fn init() {
	unsafe {
		crate::sync::once::OnceInit::init(&SHARED_TABLE, Mutex::new(BTreeMap::new()));
	}
}

#[cfg(not(test))]
fn table() -> &'static Mutex<BTreeMap<Key, FrameId>> {
	&SHARED_TABLE
}

#[cfg(test)]
fn table() -> &'static Mutex<BTreeMap<Key, FrameId>> {
	test_support::table()
}

/// Looks up an existing shared frame for `(identity, offset)`.
pub fn lookup(identity: u64, offset: u64) -> Option<FrameId> {
	table().lock().get(&(identity, offset)).copied()
}

/// Records that `(identity, offset)` is now backed by frame `id`.
///
/// Overwrites any previous entry for the same key; callers only insert
/// after confirming via [`lookup`] that no live entry exists, since
/// [`crate::vm::frame::FrameTable::remove`] is what clears a stale one out.
pub fn insert(identity: u64, offset: u64, id: FrameId) {
	table().lock().insert((identity, offset), id);
}

/// Removes every entry pointing at frame `id`, called by
/// [`crate::vm::frame::FrameTable::remove`] (`ft_remove_entry`'s
/// cross-removal) while the frame-table lock is already held, honoring
/// `spec.md` §5's lock order (frame table before shared table).
pub fn remove_by_frame(id: FrameId) {
	table().lock().retain(|_, &mut frame| frame != id);
}

#[cfg(test)]
pub(crate) mod test_support {
	use super::*;
	use alloc::boxed::Box;
	use std::cell::Cell;

	thread_local! {
		static CURRENT: Cell<Option<&'static Mutex<BTreeMap<Key, FrameId>>>> = const { Cell::new(None) };
	}

	pub(crate) fn table() -> &'static Mutex<BTreeMap<Key, FrameId>> {
		CURRENT
			.with(|c| c.get())
			.expect("call within `shared::test_support::with_shared_table`")
	}

	pub(crate) fn with_shared_table<R>(body: impl FnOnce() -> R) -> R {
		let leaked: &'static Mutex<BTreeMap<Key, FrameId>> = Box::leak(Box::new(Mutex::new(BTreeMap::new())));
		CURRENT.with(|c| c.set(Some(leaked)));
		body()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use test_support::with_shared_table;

	#[test]
	fn lookup_misses_until_inserted() {
		with_shared_table(|| {
			assert_eq!(lookup(1, 0), None);
			insert(1, 0, 42);
			assert_eq!(lookup(1, 0), Some(42));
		});
	}

	#[test]
	fn remove_by_frame_clears_all_matching_entries() {
		with_shared_table(|| {
			insert(1, 0, 7);
			insert(2, 0, 7);
			insert(3, 0, 8);
			remove_by_frame(7);
			assert_eq!(lookup(1, 0), None);
			assert_eq!(lookup(2, 0), None);
			assert_eq!(lookup(3, 0), Some(8));
		});
	}
}
