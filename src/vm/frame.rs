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

//! The global frame table: allocation, second-chance eviction, and pinning
//! (`spec.md` §4.3).
//!
//! Grounded on `original_source/src/vm/frame.c`: frames are kept in
//! insertion (clock) order, eviction walks that order twice (clear-and-skip
//! referenced frames, then take the first unpinned frame regardless of
//! reference state), and removing a frame also scans the shared table for
//! an entry pointing at it (`ft_remove_entry`). The lock order from
//! `spec.md` §5 — frame table, then shared table, then swap, then a given
//! frame's own owners lock — is load-bearing here: [`FrameTable::evict_one`]
//! never holds the table-wide lock while touching an individual frame's
//! owners.

use crate::{
	config,
	device::PageDirectory,
	error::{Error, KResult},
	sync::mutex::Mutex,
	vm::{FrameId, shared, spt::SupplementalPageTable, swap},
};
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, sync::Weak, vec::Vec};

/// One mapping of a frame into a process's address space.
pub struct Owner {
	pub spt: Weak<SupplementalPageTable>,
	pub upage: usize,
}

/// A physical frame and everyone currently mapping it.
pub struct FrameEntryInner {
	pub id: FrameId,
	data: Box<[u8; config::PAGE_SIZE]>,
	owners: Vec<Owner>,
	/// `true` if any owner may write to this frame.
	pub writable: bool,
	/// OR of every owner's dirty bit observed so far.
	pub modified: bool,
	/// The clock algorithm's reference bit.
	pub referenced: bool,
	/// Pin count; non-zero means this frame must not be chosen as a victim
	/// (`spec.md` invariant 7).
	pinned: u32,
}

impl FrameEntryInner {
	/// Returns the frame's contents.
	pub fn data(&self) -> &[u8; config::PAGE_SIZE] {
		&self.data
	}

	/// Returns the frame's contents, mutably.
	pub fn data_mut(&mut self) -> &mut [u8; config::PAGE_SIZE] {
		&mut self.data
	}

	/// Adds an owner to this frame (a new shared mapping, or the initial
	/// one).
	pub fn add_owner(&mut self, spt: &Arc<SupplementalPageTable>, upage: usize) {
		self.owners.push(Owner {
			spt: Arc::downgrade(spt),
			upage,
		});
	}

	/// Removes the owner identified by `(spt, upage)`. Returns `true` if the
	/// owners list is now empty.
	pub fn remove_owner(&mut self, spt: &Arc<SupplementalPageTable>, upage: usize) -> bool {
		self.owners
			.retain(|o| !(o.upage == upage && Weak::ptr_eq(&o.spt, &Arc::downgrade(spt))));
		self.owners.is_empty()
	}

	/// Every current owner, upgraded where the owning address space is
	/// still alive.
	pub fn owners(&self) -> impl Iterator<Item = (Arc<SupplementalPageTable>, usize)> + '_ {
		self.owners
			.iter()
			.filter_map(|o| Some((o.spt.upgrade()?, o.upage)))
	}

	/// Tells whether this frame currently has any owner.
	pub fn has_owners(&self) -> bool {
		!self.owners.is_empty()
	}
}

/// The global frame table: a singleton bounding how many user frames exist
/// at once.
pub struct FrameTable {
	capacity: usize,
	entries: BTreeMap<FrameId, Arc<Mutex<FrameEntryInner>>>,
	/// Insertion order, walked by the clock algorithm. Restarted from the
	/// beginning on every eviction call, matching `ft_get_victim`'s
	/// `hash_first` per call rather than a persisted circular hand.
	clock_order: Vec<FrameId>,
	next_id: FrameId,
}

impl FrameTable {
	fn new(capacity: usize) -> Self {
		Self {
			capacity,
			entries: BTreeMap::new(),
			clock_order: Vec::new(),
			next_id: 0,
		}
	}

	/// Number of frames currently allocated.
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// Tells whether the table is at capacity.
	pub fn is_full(&self) -> bool {
		self.entries.len() >= self.capacity
	}

	/// Allocates a brand new frame, filled with `fill`. Fails with
	/// [`Error::OutOfMemory`] if the table is at capacity; the caller
	/// (`vm::alloc`) is responsible for evicting first.
	pub fn insert(&mut self, fill: [u8; config::PAGE_SIZE], writable: bool) -> KResult<FrameId> {
		if self.is_full() {
			return Err(Error::OutOfMemory);
		}
		let id = self.next_id;
		self.next_id += 1;
		let entry = FrameEntryInner {
			id,
			data: Box::new(fill),
			owners: Vec::new(),
			writable,
			modified: false,
			referenced: true,
			pinned: 0,
		};
		self.entries.insert(id, Arc::new(Mutex::new(entry)));
		self.clock_order.push(id);
		Ok(id)
	}

	/// Looks up a frame by id.
	pub fn get(&self, id: FrameId) -> Option<Arc<Mutex<FrameEntryInner>>> {
		self.entries.get(&id).cloned()
	}

	/// Increments the pin count of frame `id`, if it exists.
	pub fn pin(&self, id: FrameId) {
		if let Some(entry) = self.entries.get(&id) {
			entry.lock().pinned += 1;
		}
	}

	/// Decrements the pin count of frame `id`, if it exists.
	pub fn unpin(&self, id: FrameId) {
		if let Some(entry) = self.entries.get(&id) {
			let mut e = entry.lock();
			e.pinned = e.pinned.saturating_sub(1);
		}
	}

	/// Removes frame `id` from the table and from the clock order, also
	/// dropping any shared-table entry that referenced it (`ft_remove_entry`
	/// cross-removal, `spec.md` §2 supplement).
	///
	/// The shared-table lock is taken here, after the frame-table lock the
	/// caller already holds, honoring `spec.md` §5's lock order.
	fn remove(&mut self, id: FrameId) {
		self.entries.remove(&id);
		self.clock_order.retain(|&fid| fid != id);
		shared::remove_by_frame(id);
	}

	/// Selects an eviction victim following the two-pass second-chance
	/// algorithm (`spec.md` §4.3, `ft_get_victim`):
	///
	/// 1. Walk in clock order; the first unpinned frame whose reference bit
	///    is clear wins. Referenced-but-unpinned frames have their bit
	///    cleared and are skipped (the "second chance").
	/// 2. If that walk finds nothing, walk again and take the first
	///    unpinned frame regardless of reference state.
	/// 3. If every frame is pinned, fail with [`Error::AllPinned`].
	fn select_victim(&self) -> KResult<FrameId> {
		for &id in &self.clock_order {
			let entry = &self.entries[&id];
			let mut e = entry.lock();
			if e.pinned > 0 {
				continue;
			}
			if e.referenced {
				e.referenced = false;
				continue;
			}
			return Ok(id);
		}
		for &id in &self.clock_order {
			let e = self.entries[&id].lock();
			if e.pinned == 0 {
				return Ok(id);
			}
		}
		Err(Error::AllPinned)
	}
}

#[cfg(not(test))]
static FRAME_TABLE: crate::sync::once::OnceInit<Mutex<FrameTable>> =
	unsafe { crate::sync::once::OnceInit::new() };

/// Initializes the frame table with room for `capacity` frames.
///
/// Must be called exactly once, before any other function in this module.
#[cfg(not(test))]
pub fn init(capacity: usize) {
	unsafe {
		crate::sync::once::OnceInit::init(&FRAME_TABLE, Mutex::new(FrameTable::new(capacity)));
	}
}

#[cfg(not(test))]
fn table() -> &'static Mutex<FrameTable> {
	&FRAME_TABLE
}

#[cfg(test)]
fn table() -> &'static Mutex<FrameTable> {
	test_support::table()
}

/// Tells whether the frame table currently has room for another frame
/// without evicting.
pub fn has_room() -> bool {
	!table().lock().is_full()
}

/// Inserts a newly materialized frame, returning its id.
pub fn insert(fill: [u8; config::PAGE_SIZE], writable: bool) -> KResult<FrameId> {
	table().lock().insert(fill, writable)
}

/// Returns the frame entry for `id`, if resident.
pub fn get(id: FrameId) -> Option<Arc<Mutex<FrameEntryInner>>> {
	table().lock().get(id)
}

pub fn pin(id: FrameId) {
	table().lock().pin(id);
}

pub fn unpin(id: FrameId) {
	table().lock().unpin(id);
}

/// Removes frame `id` once its owners list has emptied (called by
/// [`crate::vm::spt::SupplementalPageTable::destroy`] and
/// [`crate::vm::spt::SupplementalPageTable::remove_entry`] after detaching
/// the last owner).
pub fn remove(id: FrameId) {
	table().lock().remove(id);
}

/// Evicts exactly one frame, writing its contents back to swap or to its
/// backing file as appropriate, and detaching every owner
/// (`spec.md` §4.3 "Eviction mechanics").
///
/// Each owner's SPTE is transitioned to a non-resident backing type by
/// `SupplementalPageTable::mark_evicted`; the corresponding page-directory
/// mapping is torn down first so no stale translation survives.
///
/// The victim is pinned for the entire span between selection and removal
/// (`spec.md` §4.3, "while reading or writing a frame, that frame MUST be
/// pinned"): otherwise it sits unmapped but still present in the table
/// while its contents are written out, and a concurrent `evict_one` call
/// could select the same frame again, since unmapping already cleared its
/// reference bit.
pub fn evict_one() -> KResult<()> {
	let victim_id = table().lock().select_victim()?;
	table().lock().pin(victim_id);
	let entry = table().lock().get(victim_id).ok_or(Error::AllPinned)?;
	// Snapshot owners and collect dirty/accessed bits before mutating any
	// SPTE, since unmapping may be the only chance to read hardware bits.
	let owners: Vec<(Arc<SupplementalPageTable>, usize)> = entry.lock().owners().collect();
	let mut any_dirty = false;
	for (spt, upage) in &owners {
		let dirty = spt.unmap_for_eviction(*upage);
		any_dirty |= dirty;
	}
	{
		let mut e = entry.lock();
		e.modified |= any_dirty;
	}
	let (writable, modified, data_copy) = {
		let e = entry.lock();
		(e.writable, e.modified, *e.data())
	};
	// Memory-mapped owners flush straight to their file instead of swap,
	// unless the file itself is unwritable (`spec.md` §4.3).
	let mut flushed_to_file = false;
	for (spt, upage) in &owners {
		flushed_to_file |= spt.writeback_mmapped(*upage, &data_copy);
	}
	if flushed_to_file {
		for (spt, upage) in &owners {
			spt.mark_non_resident(*upage);
		}
	} else if writable && modified {
		let slot = swap::allocate()?;
		swap::write_page(&data_copy, slot)?;
		for (spt, upage) in &owners {
			spt.mark_swapped(*upage, slot);
		}
	} else {
		for (spt, upage) in &owners {
			spt.mark_non_resident(*upage);
		}
	}
	table().lock().remove(victim_id);
	table().lock().unpin(victim_id);
	Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
	use super::*;
	use std::cell::Cell;

	thread_local! {
		static CURRENT: Cell<Option<&'static Mutex<FrameTable>>> = const { Cell::new(None) };
	}

	pub(crate) fn table() -> &'static Mutex<FrameTable> {
		CURRENT
			.with(|c| c.get())
			.expect("call within `frame::test_support::with_frame_table`")
	}

	pub(crate) fn with_frame_table<R>(capacity: usize, body: impl FnOnce() -> R) -> R {
		let leaked: &'static Mutex<FrameTable> =
			Box::leak(Box::new(Mutex::new(FrameTable::new(capacity))));
		CURRENT.with(|c| c.set(Some(leaked)));
		body()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::config::PAGE_SIZE;

	#[test]
	fn insert_respects_capacity() {
		let mut t = FrameTable::new(1);
		t.insert([0; PAGE_SIZE], true).unwrap();
		assert!(matches!(t.insert([0; PAGE_SIZE], true), Err(Error::OutOfMemory)));
	}

	#[test]
	fn pinned_frame_is_never_selected() {
		let mut t = FrameTable::new(2);
		let a = t.insert([0; PAGE_SIZE], true).unwrap();
		let b = t.insert([0; PAGE_SIZE], true).unwrap();
		t.pin(a);
		// Clear reference bits so the first pass would otherwise pick
		// either frame.
		for id in [a, b] {
			t.entries[&id].lock().referenced = false;
		}
		let victim = t.select_victim().unwrap();
		assert_eq!(victim, b);
	}

	#[test]
	fn all_pinned_fails() {
		let mut t = FrameTable::new(1);
		let a = t.insert([0; PAGE_SIZE], true).unwrap();
		t.pin(a);
		assert!(matches!(t.select_victim(), Err(Error::AllPinned)));
	}

	#[test]
	fn second_chance_clears_reference_bit_before_picking() {
		let mut t = FrameTable::new(2);
		let a = t.insert([0; PAGE_SIZE], true).unwrap();
		let b = t.insert([0; PAGE_SIZE], true).unwrap();
		// Both start referenced; first pass should clear both bits and find
		// no victim, second pass picks the first unpinned (a).
		let victim = t.select_victim().unwrap();
		assert_eq!(victim, a);
		assert!(!t.entries[&a].lock().referenced);
		assert!(!t.entries[&b].lock().referenced);
	}
}
