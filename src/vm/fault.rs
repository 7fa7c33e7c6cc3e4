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

//! The page-fault handler (`spec.md` §4.6) and the pinning glue built on
//! top of it (`spec.md` §4.3 "Pinning").
//!
//! `handle_fault` is the seven-step policy verbatim: reject rights
//! violations/null/spurious faults, record `esp`, resolve or grow the
//! stack, reject a write to a read-only page, then materialize per the
//! SPTE's backing type (consulting the shared table first for a
//! non-writable `FilePage`) and install the mapping.

use crate::{
	config,
	error::{Error, KResult},
	thread::Thread,
	vm::{
		FrameId, frame,
		alloc::allocate_user_page,
		shared,
		spt::{Backing, EntrySnapshot, SupplementalPageTable},
		swap,
	},
};
use alloc::{sync::Arc, vec::Vec};

fn page_align(addr: usize) -> usize {
	addr & !(config::PAGE_SIZE - 1)
}

/// The interrupt-dispatch plumbing's description of a page fault, reduced
/// to what the core needs (`spec.md` §4.6 "Entry data").
pub struct FaultInfo {
	/// The faulting virtual address.
	pub addr: usize,
	/// The faulting thread's stack pointer at the time of the fault.
	pub esp: usize,
	/// `true` if the page was present (a rights violation, not a
	/// not-present fault).
	pub present: bool,
	/// `true` if the access was a write.
	pub write: bool,
}

/// Materializes `upage` per its SPTE's backing type, returning the
/// resulting frame id. Consults the shared table first for a
/// non-writable `FilePage`.
fn materialize(spt: &Arc<SupplementalPageTable>, upage: usize, snap: &EntrySnapshot) -> KResult<FrameId> {
	match snap.backing {
		Backing::NewStackPage | Backing::ZeroPage => allocate_user_page([0; config::PAGE_SIZE], true),
		Backing::StackPage => {
			let slot = snap.swap_block.ok_or(Error::InvalidAccess)?;
			let mut buf = [0u8; config::PAGE_SIZE];
			swap::read_page(&mut buf, slot)?;
			swap::release(slot)?;
			let id = allocate_user_page(buf, true)?;
			spt.finish_swap_in(upage);
			Ok(id)
		}
		Backing::FilePage => {
			if !snap.writable {
				if let Some(file) = &snap.file {
					if let Some(id) = shared::lookup(file.identity(), snap.offset) {
						return Ok(id);
					}
				}
			}
			let mut buf = [0u8; config::PAGE_SIZE];
			if let Some(file) = &snap.file {
				file.read_at(snap.offset, &mut buf[..snap.read_bytes])?;
			}
			let id = allocate_user_page(buf, snap.writable)?;
			if !snap.writable {
				if let Some(file) = &snap.file {
					shared::insert(file.identity(), snap.offset, id);
				}
			}
			Ok(id)
		}
		Backing::MMappedPage => {
			if let Some(slot) = snap.swap_block {
				let mut buf = [0u8; config::PAGE_SIZE];
				swap::read_page(&mut buf, slot)?;
				swap::release(slot)?;
				let id = allocate_user_page(buf, true)?;
				spt.finish_swap_in(upage);
				Ok(id)
			} else {
				let mut buf = [0u8; config::PAGE_SIZE];
				if let Some(file) = &snap.file {
					file.read_at(snap.offset, &mut buf[..snap.read_bytes])?;
				}
				allocate_user_page(buf, true)
			}
		}
		Backing::InSwap => {
			let slot = snap.swap_block.ok_or(Error::InvalidAccess)?;
			let mut buf = [0u8; config::PAGE_SIZE];
			swap::read_page(&mut buf, slot)?;
			swap::release(slot)?;
			let id = allocate_user_page(buf, snap.writable)?;
			spt.finish_swap_in(upage);
			Ok(id)
		}
	}
}

/// Resolves `upage` into a resident frame and installs it, assuming the
/// SPTE already exists and, if `write` is set, is writable. Shared between
/// [`handle_fault`] (after stack growth) and [`pin_range`] (which never
/// grows the stack itself).
fn resolve_page(spt: &Arc<SupplementalPageTable>, upage: usize, write: bool) -> KResult<FrameId> {
	if write && spt.is_writable(upage) == Some(false) {
		return Err(Error::InvalidAccess);
	}
	if let Some(id) = spt.frame_id_of(upage) {
		return Ok(id);
	}
	let snap = spt.entry_snapshot(upage).ok_or(Error::InvalidAccess)?;
	let frame_id = materialize(spt, upage, &snap)?;
	let frame_arc = frame::get(frame_id).ok_or(Error::InvalidAccess)?;
	frame_arc.lock().add_owner(spt, upage);
	spt.attach_frame(upage, frame_arc.clone());
	spt.with_page_dir(|dir| dir.install(upage, frame_id, snap.writable))
		.unwrap_or(Ok(()))?;
	// Step 5: propagate the stored accessed/modified bits into the freshly
	// installed mapping.
	spt.with_page_dir(|dir| {
		dir.set_accessed(upage, true);
		if write {
			dir.set_dirty(upage, true);
		}
	});
	// Step 7: mark accessed on every co-owner of this frame, not just the
	// faulting one (a shared read-only file page may already have other
	// owners by the time this one faults in).
	let owners: Vec<(Arc<SupplementalPageTable>, usize)> = frame_arc.lock().owners().collect();
	for (owner_spt, owner_upage) in owners {
		owner_spt.set_accessed(owner_upage, true);
		owner_spt.with_page_dir(|dir| dir.set_accessed(owner_upage, true));
	}
	Ok(frame_id)
}

/// Handles a user page fault on `thread`, per `spec.md` §4.6.
pub fn handle_fault(thread: &Arc<Thread>, info: FaultInfo) -> KResult<()> {
	// 1. Rights violation, null access, or a spurious fault on an already
	// mapped page are all rejected outright.
	if info.present || info.addr == 0 {
		return Err(Error::InvalidAccess);
	}
	let upage = page_align(info.addr);
	let spt = &thread.spt;
	if spt.with_page_dir(|dir| dir.is_mapped(upage)).unwrap_or(false) {
		return Err(Error::InvalidAccess);
	}
	// 2. Record esp for later pin logic.
	*thread.last_user_sp.lock() = info.esp;
	// 3. Resolve or grow the stack.
	if !spt.find(upage) {
		let is_push_like = info.addr + config::MAX_PUSH >= info.esp;
		let mut pages = thread.stack_pages.lock();
		if is_push_like && *pages < config::MAX_STACK_PAGES {
			spt.create_stack_page(upage);
			*pages += 1;
		} else {
			return Err(Error::InvalidAccess);
		}
	}
	// 4-7: reject write to read-only, materialize, and install.
	resolve_page(spt, upage, info.write)?;
	Ok(())
}

/// Walks `[start, start + len)` page by page, materializing every page
/// before pinning any of them, so none can be evicted mid-operation
/// (`spec.md` §4.3 "Pinning"). Returns the pinned pages, to be passed back
/// to [`unpin_range`].
pub fn pin_range(thread: &Arc<Thread>, start: usize, len: usize) -> KResult<Vec<usize>> {
	if len == 0 {
		return Ok(Vec::new());
	}
	let first = page_align(start);
	let last = page_align(start + len - 1);
	let mut upages = Vec::new();
	let mut p = first;
	loop {
		upages.push(p);
		if p == last {
			break;
		}
		p += config::PAGE_SIZE;
	}
	let spt = &thread.spt;
	for &upage in &upages {
		if !spt.find(upage) {
			let is_push_like = upage + config::MAX_PUSH >= *thread.last_user_sp.lock();
			let mut pages = thread.stack_pages.lock();
			if is_push_like && *pages < config::MAX_STACK_PAGES {
				spt.create_stack_page(upage);
				*pages += 1;
			} else {
				return Err(Error::InvalidAccess);
			}
		}
		resolve_page(spt, upage, false)?;
	}
	for &upage in &upages {
		if let Some(id) = spt.frame_id_of(upage) {
			frame::pin(id);
		}
	}
	Ok(upages)
}

/// Releases pins taken by a prior [`pin_range`] call.
pub fn unpin_range(thread: &Arc<Thread>, upages: &[usize]) {
	let spt = &thread.spt;
	for &upage in upages {
		if let Some(id) = spt.frame_id_of(upage) {
			frame::unpin(id);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::{
		config::PAGE_SIZE,
		device::{FileHandle, PageDirectory},
		thread::Tid,
		vm::{frame::test_support::with_frame_table, shared::test_support::with_shared_table},
	};
	use alloc::{boxed::Box, collections::BTreeMap};

	#[derive(Debug)]
	struct NullFile;

	impl FileHandle for NullFile {
		fn read_at(&self, _offset: u64, buf: &mut [u8]) -> KResult<usize> {
			buf.fill(0);
			Ok(buf.len())
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

	struct FakeDir {
		mapped: BTreeMap<usize, (usize, bool)>,
	}

	impl FakeDir {
		fn new() -> Self {
			Self {
				mapped: BTreeMap::new(),
			}
		}
	}

	impl PageDirectory for FakeDir {
		fn install(&mut self, upage: usize, kpage: usize, writable: bool) -> KResult<()> {
			self.mapped.insert(upage, (kpage, writable));
			Ok(())
		}

		fn destroy(&mut self, upage: usize) {
			self.mapped.remove(&upage);
		}

		fn is_mapped(&self, upage: usize) -> bool {
			self.mapped.contains_key(&upage)
		}

		fn take_accessed(&mut self, _upage: usize) -> bool {
			false
		}

		fn take_dirty(&mut self, _upage: usize) -> bool {
			false
		}

		fn set_accessed(&mut self, _upage: usize, _value: bool) {}

		fn set_dirty(&mut self, _upage: usize, _value: bool) {}
	}

	fn new_thread(tid: Tid) -> Arc<Thread> {
		let t = Thread::new(tid, "t", config::PRI_DEFAULT);
		t.spt.bind_page_directory(Box::new(FakeDir::new()));
		t
	}

	#[test]
	fn stack_growth_within_push_range_succeeds() {
		with_shared_table(|| {
			with_frame_table(4, || {
				let t = new_thread(1);
				let esp = 0x8000_0000usize;
				let addr = esp - 4;
				let result = handle_fault(
					&t,
					FaultInfo {
						addr,
						esp,
						present: false,
						write: true,
					},
				);
				assert!(result.is_ok());
				assert!(t.spt.is_resident(page_align(addr)));
			});
		});
	}

	#[test]
	fn fault_far_below_esp_is_rejected() {
		with_shared_table(|| {
			with_frame_table(4, || {
				let t = new_thread(1);
				let esp = 0x8000_0000usize;
				let addr = esp - PAGE_SIZE - 4096;
				let result = handle_fault(
					&t,
					FaultInfo {
						addr,
						esp,
						present: false,
						write: true,
					},
				);
				assert_eq!(result.unwrap_err(), Error::InvalidAccess);
			});
		});
	}

	#[test]
	fn write_to_read_only_file_page_is_rejected() {
		with_shared_table(|| {
			with_frame_table(4, || {
				let t = new_thread(1);
				let file: Arc<dyn FileHandle + Send + Sync> = Arc::new(NullFile);
				SupplementalPageTable::create_file_page(&t.spt, 0x1000, file, 0, false, 100, Backing::FilePage)
					.unwrap();
				let result = handle_fault(
					&t,
					FaultInfo {
						addr: 0x1000,
						esp: 0x8000_0000,
						present: false,
						write: true,
					},
				);
				assert_eq!(result.unwrap_err(), Error::InvalidAccess);
			});
		});
	}

	#[test]
	fn read_only_file_page_is_shared_across_processes() {
		with_shared_table(|| {
			with_frame_table(4, || {
				let a = new_thread(1);
				let b = new_thread(2);
				let file: Arc<dyn FileHandle + Send + Sync> = Arc::new(NullFile);
				SupplementalPageTable::create_file_page(
					&a.spt,
					0x1000,
					file.clone(),
					0,
					false,
					100,
					Backing::FilePage,
				)
				.unwrap();
				SupplementalPageTable::create_file_page(&b.spt, 0x1000, file, 0, false, 100, Backing::FilePage)
					.unwrap();
				handle_fault(
					&a,
					FaultInfo {
						addr: 0x1000,
						esp: 0x8000_0000,
						present: false,
						write: false,
					},
				)
				.unwrap();
				handle_fault(
					&b,
					FaultInfo {
						addr: 0x1000,
						esp: 0x8000_0000,
						present: false,
						write: false,
					},
				)
				.unwrap();
				assert_eq!(a.spt.frame_id_of(0x1000), b.spt.frame_id_of(0x1000));
			});
		});
	}

	#[test]
	fn pin_range_spans_multiple_pages_and_materializes_all_first() {
		with_shared_table(|| {
			with_frame_table(4, || {
				let t = new_thread(1);
				t.spt.create_stack_page(0x2000);
				t.spt.create_stack_page(0x2000 + PAGE_SIZE);
				let pinned = pin_range(&t, 0x2000, PAGE_SIZE + 1).unwrap();
				assert_eq!(pinned.len(), 2);
				for upage in &pinned {
					assert!(t.spt.is_resident(*upage));
				}
				unpin_range(&t, &pinned);
			});
		});
	}
}
