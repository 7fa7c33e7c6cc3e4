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

//! Per-process supplemental page table (`spec.md` §4.5).
//!
//! Grounded on `original_source/src/vm/page.c`: `create_file_page`
//! deduplicates and widens an existing entry instead of erroring on a
//! second `load_segment` call for the same page, recursing onto the next
//! page when the combined `read_bytes` overflows one page; `spt_destroy_entry`
//! writes back a dirty resident file/zero page, detaches from the frame's
//! owners (freeing it when that empties it), and otherwise streams swapped
//! contents back to the file and releases the swap slot.

use crate::{
	config,
	device::{FileHandle, PageDirectory},
	error::{Error, KResult},
	sync::mutex::Mutex,
	thread::Tid,
	vm::{
		FrameId,
		frame::{self, FrameEntryInner},
		swap,
	},
};
use alloc::{
	boxed::Box,
	collections::BTreeMap,
	sync::Arc,
	vec::Vec,
};

fn page_align(addr: usize) -> usize {
	addr & !(config::PAGE_SIZE - 1)
}

/// What a supplemental page table entry is backed by (`spec.md` §3).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backing {
	/// Never-faulted growable stack page.
	NewStackPage,
	/// A stack page that was evicted at least once; its contents live in
	/// swap.
	StackPage,
	/// Zero-filled on first fault, no backing file.
	ZeroPage,
	/// Backed by a range of a file.
	FilePage,
	/// Backed by a range of a file, via `mmap`.
	MMappedPage,
	/// Swapped out; `swap_block` names where.
	InSwap,
}

struct Spte {
	backing: Backing,
	file: Option<Arc<dyn FileHandle + Send + Sync>>,
	offset: u64,
	read_bytes: usize,
	swap_block: Option<usize>,
	writable: bool,
	modified: bool,
	accessed: bool,
	pinned: bool,
	frame: Option<Arc<Mutex<FrameEntryInner>>>,
}

/// Per-process map from user virtual page to page descriptor.
pub struct SupplementalPageTable {
	pub tid: Tid,
	entries: Mutex<BTreeMap<usize, Spte>>,
	page_dir: Mutex<Option<Box<dyn PageDirectory + Send>>>,
}

impl SupplementalPageTable {
	/// Creates a new, empty table for thread/process `tid`.
	pub fn new(tid: Tid) -> Arc<Self> {
		Arc::new(Self {
			tid,
			entries: Mutex::new(BTreeMap::new()),
			page_dir: Mutex::new(None),
		})
	}

	/// Binds the page directory used to install/destroy mappings for this
	/// address space. Must be called before the first fault is handled.
	pub fn bind_page_directory(&self, dir: Box<dyn PageDirectory + Send>) {
		*self.page_dir.lock() = Some(dir);
	}

	/// Returns whether `upage` has an entry at all.
	pub fn find(&self, upage: usize) -> bool {
		self.entries.lock().contains_key(&page_align(upage))
	}

	/// Returns whether `upage` currently has a resident frame.
	pub fn is_resident(&self, upage: usize) -> bool {
		self.entries
			.lock()
			.get(&page_align(upage))
			.is_some_and(|e| e.frame.is_some())
	}

	/// Returns the backing type of `upage`, if an entry exists.
	pub fn backing_of(&self, upage: usize) -> Option<Backing> {
		self.entries.lock().get(&page_align(upage)).map(|e| e.backing)
	}

	/// Returns the id of the frame currently backing `upage`, if resident.
	pub(crate) fn frame_id_of(&self, upage: usize) -> Option<FrameId> {
		self.entries
			.lock()
			.get(&page_align(upage))?
			.frame
			.as_ref()
			.map(|f| f.lock().id)
	}

	/// Returns whether `upage` is writable, if an entry exists.
	pub fn is_writable(&self, upage: usize) -> Option<bool> {
		self.entries.lock().get(&page_align(upage)).map(|e| e.writable)
	}

	/// Creates a growable stack page entry.
	pub fn create_stack_page(&self, upage: usize) {
		self.entries.lock().insert(
			page_align(upage),
			Spte {
				backing: Backing::NewStackPage,
				file: None,
				offset: 0,
				read_bytes: 0,
				swap_block: None,
				writable: true,
				modified: false,
				accessed: false,
				pinned: false,
				frame: None,
			},
		);
	}

	/// Creates a file-backed entry (ELF load segment or `mmap`), widening
	/// and deduplicating against an existing entry the way
	/// `create_file_page` does, and recursing onto the following page when
	/// `read_bytes` overflows one page.
	///
	/// Returns [`Error::DuplicateMapping`] only when `backing` is
	/// [`Backing::MMappedPage`] and the page is already mapped (mmap must
	/// not silently widen another mapping).
	pub fn create_file_page(
		self_arc: &Arc<Self>,
		upage: usize,
		file: Arc<dyn FileHandle + Send + Sync>,
		offset: u64,
		writable: bool,
		read_bytes: usize,
		backing: Backing,
	) -> KResult<()> {
		let upage = page_align(upage);
		let mut entries = self_arc.entries.lock();
		if let Some(existing) = entries.get_mut(&upage) {
			if backing == Backing::MMappedPage {
				return Err(Error::DuplicateMapping);
			}
			let new_read_bytes = existing.read_bytes + read_bytes;
			if new_read_bytes > config::PAGE_SIZE {
				existing.read_bytes = config::PAGE_SIZE;
				existing.writable |= writable;
				if existing.backing == Backing::ZeroPage && backing != Backing::ZeroPage {
					existing.backing = backing;
				}
				let overflow = new_read_bytes - config::PAGE_SIZE;
				drop(entries);
				return Self::create_file_page(
					self_arc,
					upage + config::PAGE_SIZE,
					file,
					offset + config::PAGE_SIZE as u64,
					writable,
					overflow,
					backing,
				);
			}
			existing.read_bytes = new_read_bytes;
			existing.writable |= writable;
			if existing.backing == Backing::ZeroPage && backing != Backing::ZeroPage {
				existing.backing = backing;
			}
			return Ok(());
		}
		entries.insert(
			upage,
			Spte {
				backing,
				file: Some(file),
				offset,
				read_bytes,
				swap_block: None,
				writable,
				modified: false,
				accessed: false,
				pinned: false,
				frame: None,
			},
		);
		Ok(())
	}

	/// Attaches a materialized frame to `upage`'s entry, called by the
	/// fault handler once it has a physical frame to install.
	pub(crate) fn attach_frame(&self, upage: usize, frame: Arc<Mutex<FrameEntryInner>>) {
		if let Some(e) = self.entries.lock().get_mut(&page_align(upage)) {
			e.frame = Some(frame);
		}
	}

	/// For the fault handler: everything needed to materialize `upage`.
	pub(crate) fn entry_snapshot(&self, upage: usize) -> Option<EntrySnapshot> {
		self.entries.lock().get(&page_align(upage)).map(|e| EntrySnapshot {
			backing: e.backing,
			file: e.file.clone(),
			offset: e.offset,
			read_bytes: e.read_bytes,
			swap_block: e.swap_block,
			writable: e.writable,
		})
	}

	/// Runs `f` with the page directory, if bound.
	pub(crate) fn with_page_dir<R>(&self, f: impl FnOnce(&mut (dyn PageDirectory + Send)) -> R) -> Option<R> {
		self.page_dir.lock().as_deref_mut().map(f)
	}

	/// Called by the frame table during eviction: unmaps `upage` from the
	/// page directory and folds its dirty bit into the SPTE's `modified`
	/// flag, returning that dirty bit.
	pub(crate) fn unmap_for_eviction(&self, upage: usize) -> bool {
		let upage = page_align(upage);
		let dirty = self
			.page_dir
			.lock()
			.as_deref_mut()
			.map(|dir| {
				let dirty = dir.take_dirty(upage);
				dir.destroy(upage);
				dirty
			})
			.unwrap_or(false);
		if let Some(e) = self.entries.lock().get_mut(&upage) {
			e.modified |= dirty;
		}
		dirty
	}

	/// For a dirty `MMappedPage` owner being evicted: writes the page
	/// straight back to its backing file instead of swap, when the file is
	/// writable (`spec.md` §4.3 "For memory-mapped pages, dirty bytes are
	/// flushed to the original file region instead of swap; only if the
	/// file is unwritable do they go to swap"). Returns whether it did so;
	/// `false` means the caller should fall back to the ordinary swap path.
	pub(crate) fn writeback_mmapped(&self, upage: usize, data: &[u8; config::PAGE_SIZE]) -> bool {
		let upage = page_align(upage);
		let entries = self.entries.lock();
		let Some(e) = entries.get(&upage) else {
			return false;
		};
		if e.backing != Backing::MMappedPage || !e.modified {
			return false;
		}
		let (Some(file), read_bytes, offset) = (&e.file, e.read_bytes, e.offset) else {
			return false;
		};
		if !file.is_writable() {
			return false;
		}
		let _ = file.write_at(offset, &data[..read_bytes]);
		true
	}

	/// Clears `upage`'s swap slot after the fault handler has read it back
	/// in, reverting an `InSwap` entry to `FilePage` (if it has a backing
	/// file) or `StackPage` (otherwise), per `spec.md` §4.5's
	/// materialization table ("mark type FilePage/StackPage"). A no-op on
	/// the backing type for any other entry (e.g. `MMappedPage`, which
	/// keeps its type across a swap round-trip).
	pub(crate) fn finish_swap_in(&self, upage: usize) {
		if let Some(e) = self.entries.lock().get_mut(&page_align(upage)) {
			e.swap_block = None;
			if e.backing == Backing::InSwap {
				e.backing = if e.file.is_some() {
					Backing::FilePage
				} else {
					Backing::StackPage
				};
			}
		}
	}

	/// Transitions `upage`'s entry to `InSwap` at `slot`, after eviction
	/// wrote it out.
	pub(crate) fn mark_swapped(&self, upage: usize, slot: usize) {
		if let Some(e) = self.entries.lock().get_mut(&page_align(upage)) {
			e.swap_block = Some(slot);
			e.backing = Backing::InSwap;
			e.frame = None;
		}
	}

	/// Transitions `upage`'s entry back to non-resident without swapping
	/// (clean file/zero page; reload from source on next fault).
	pub(crate) fn mark_non_resident(&self, upage: usize) {
		if let Some(e) = self.entries.lock().get_mut(&page_align(upage)) {
			e.frame = None;
			if e.backing != Backing::MMappedPage {
				e.backing = Backing::FilePage;
			}
		}
	}

	/// Records the accessed bit for `upage`.
	pub(crate) fn set_accessed(&self, upage: usize, value: bool) {
		if let Some(e) = self.entries.lock().get_mut(&page_align(upage)) {
			e.accessed = value;
		}
	}

	fn teardown_one(self_arc: &Arc<Self>, upage: usize, spte: Spte) {
		if let Some(frame) = spte.frame {
			self_arc.with_page_dir(|dir| dir.destroy(upage));
			let should_free = {
				let mut f = frame.lock();
				let writes_back_on_destroy = matches!(spte.backing, Backing::FilePage | Backing::ZeroPage)
					|| (spte.backing == Backing::MMappedPage && spte.file.as_ref().is_some_and(|f| f.is_writable()));
				if f.modified && writes_back_on_destroy {
					if let Some(file) = &spte.file {
						let _ = file.write_at(spte.offset, &f.data()[..spte.read_bytes]);
					}
				}
				f.remove_owner(self_arc, upage)
			};
			if should_free {
				let id = frame.lock().id;
				frame::remove(id);
			}
		} else if let Some(slot) = spte.swap_block {
			if spte.backing == Backing::InSwap {
				if let Some(file) = &spte.file {
					let _ = swap::read_page_to_file(file.as_ref(), slot, spte.read_bytes, spte.offset);
				}
			}
			let _ = swap::release(slot);
		}
	}

	/// Removes a single entry (`munmap`, or `spt_remove_entry`), running
	/// the same teardown as whole-table [`Self::destroy`] for that one
	/// page.
	pub fn remove_entry(self_arc: &Arc<Self>, upage: usize) {
		let removed = self_arc.entries.lock().remove(&page_align(upage));
		if let Some(spte) = removed {
			Self::teardown_one(self_arc, page_align(upage), spte);
		}
	}

	/// Tears down every entry: writes back dirty resident file/zero pages and
	/// still-resident dirty `mmap` pages (so `mmap` followed by `munmap`
	/// flushes every dirty page even if it was never evicted), detaches from
	/// frame owners (freeing frames left without owners), streams swapped
	/// file pages back, and releases swap slots (`spec.md` §4.5
	/// "Destruction").
	pub fn destroy(self_arc: &Arc<Self>) {
		let drained: Vec<(usize, Spte)> = core::mem::take(&mut *self_arc.entries.lock())
			.into_iter()
			.collect();
		for (upage, spte) in drained {
			Self::teardown_one(self_arc, upage, spte);
		}
	}
}

/// A read-only snapshot of one entry, used by the fault handler to decide
/// how to materialize a page without holding the table lock across I/O.
pub(crate) struct EntrySnapshot {
	pub backing: Backing,
	pub file: Option<Arc<dyn FileHandle + Send + Sync>>,
	pub offset: u64,
	pub read_bytes: usize,
	pub swap_block: Option<usize>,
	pub writable: bool,
}

#[cfg(test)]
mod test {
	use super::*;

	#[derive(Debug)]
	struct NullFile;

	impl FileHandle for NullFile {
		fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> KResult<usize> {
			Ok(0)
		}

		fn write_at(&self, _offset: u64, buf: &[u8]) -> KResult<usize> {
			Ok(buf.len())
		}

		fn len(&self) -> KResult<u64> {
			Ok(0)
		}

		fn is_writable(&self) -> bool {
			true
		}

		fn identity(&self) -> u64 {
			1
		}
	}

	#[test]
	fn create_stack_page_then_find() {
		let spt = SupplementalPageTable::new(1);
		spt.create_stack_page(0x1000);
		assert!(spt.find(0x1000));
		assert_eq!(spt.backing_of(0x1000), Some(Backing::NewStackPage));
	}

	#[test]
	fn duplicate_file_page_widens_read_bytes() {
		let spt = SupplementalPageTable::new(1);
		let file: Arc<dyn FileHandle + Send + Sync> = Arc::new(NullFile);
		SupplementalPageTable::create_file_page(&spt, 0x2000, file.clone(), 0, false, 100, Backing::ZeroPage)
			.unwrap();
		SupplementalPageTable::create_file_page(&spt, 0x2000, file, 0, true, 200, Backing::FilePage).unwrap();
		assert_eq!(spt.backing_of(0x2000), Some(Backing::FilePage));
		assert_eq!(spt.is_writable(0x2000), Some(true));
	}

	#[test]
	fn overflowing_read_bytes_recurses_to_next_page() {
		let spt = SupplementalPageTable::new(1);
		let file: Arc<dyn FileHandle + Send + Sync> = Arc::new(NullFile);
		SupplementalPageTable::create_file_page(
			&spt,
			0x3000,
			file.clone(),
			0,
			true,
			config::PAGE_SIZE,
			Backing::FilePage,
		)
		.unwrap();
		SupplementalPageTable::create_file_page(
			&spt,
			0x3000 + config::PAGE_SIZE - 10,
			file,
			0,
			true,
			20,
			Backing::FilePage,
		)
		.unwrap();
		assert!(spt.find(0x3000 + config::PAGE_SIZE));
	}

	#[test]
	fn duplicate_mmap_rejected() {
		let spt = SupplementalPageTable::new(1);
		let file: Arc<dyn FileHandle + Send + Sync> = Arc::new(NullFile);
		SupplementalPageTable::create_file_page(&spt, 0x4000, file.clone(), 0, true, 50, Backing::MMappedPage)
			.unwrap();
		let err = SupplementalPageTable::create_file_page(&spt, 0x4000, file, 0, true, 50, Backing::MMappedPage)
			.unwrap_err();
		assert_eq!(err, Error::DuplicateMapping);
	}
}
