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

//! Per-process `mmap` table: mapping-id -> (file, base page, length)
//! (`spec.md` §3 "MMap entry", §2 component 6).
//!
//! Grounded on `original_source/src/vm/mmap.c`: `mmap_create_entry` hands
//! out a dense, monotonically increasing per-thread id; `mmap_remove_entry`
//! closes the file and tears down the backing SPT entry together. The
//! original tracks one `mmap_entry` per mapping regardless of its page
//! count (`spec.md` §3 names a single "total length in bytes" field), so
//! `remove` fans out to every page the mapping covers.

use crate::{
	config,
	device::FileHandle,
	error::{Error, KResult},
	sync::mutex::Mutex,
	vm::spt::{Backing, SupplementalPageTable},
};
use alloc::{collections::BTreeMap, sync::Arc};

struct MmapEntry {
	base: usize,
	file: Arc<dyn FileHandle + Send + Sync>,
	length: usize,
}

/// A process's table of active `mmap` mappings.
pub struct MmapTable {
	entries: Mutex<BTreeMap<u32, MmapEntry>>,
	next_id: Mutex<u32>,
}

impl MmapTable {
	/// Creates a new, empty table.
	pub fn new() -> Self {
		Self {
			entries: Mutex::new(BTreeMap::new()),
			next_id: Mutex::new(0),
		}
	}

	/// Maps `length` bytes of `file` starting at `offset` into `spt` at user
	/// page `addr`, returning the new mapping's id.
	///
	/// Fails with [`Error::InvalidAccess`] if `addr` isn't page-aligned or
	/// `length` is zero, or [`Error::DuplicateMapping`] if any covered page
	/// already has an entry (checked up front, so a rejected `mmap` leaves
	/// no partial state behind).
	pub fn create(
		&self,
		spt: &Arc<SupplementalPageTable>,
		file: Arc<dyn FileHandle + Send + Sync>,
		addr: usize,
		offset: u64,
		length: usize,
		writable: bool,
	) -> KResult<u32> {
		if length == 0 || addr % config::PAGE_SIZE != 0 {
			return Err(Error::InvalidAccess);
		}
		let page_count = length.div_ceil(config::PAGE_SIZE);
		for i in 0..page_count {
			if spt.find(addr + i * config::PAGE_SIZE) {
				return Err(Error::DuplicateMapping);
			}
		}
		for i in 0..page_count {
			let upage = addr + i * config::PAGE_SIZE;
			let page_offset = offset + (i * config::PAGE_SIZE) as u64;
			let read_bytes = config::PAGE_SIZE.min(length - i * config::PAGE_SIZE);
			SupplementalPageTable::create_file_page(
				spt,
				upage,
				file.clone(),
				page_offset,
				writable,
				read_bytes,
				Backing::MMappedPage,
			)?;
		}
		let id = {
			let mut next = self.next_id.lock();
			let id = *next;
			*next += 1;
			id
		};
		self.entries.lock().insert(
			id,
			MmapEntry {
				base: addr,
				file,
				length,
			},
		);
		Ok(id)
	}

	/// Looks up a mapping's base page and length.
	pub fn find(&self, map_id: u32) -> Option<(usize, usize)> {
		self.entries.lock().get(&map_id).map(|e| (e.base, e.length))
	}

	/// Tears down mapping `map_id`: removes the SPT entry for every page it
	/// covers (which flushes dirty pages back to the file,
	/// `spec.md` §9 "mmap followed by munmap") and drops the table's
	/// reference to the file handle.
	pub fn remove(&self, spt: &Arc<SupplementalPageTable>, map_id: u32) -> KResult<()> {
		let entry = self.entries.lock().remove(&map_id).ok_or(Error::InvalidAccess)?;
		let page_count = entry.length.div_ceil(config::PAGE_SIZE);
		for i in 0..page_count {
			SupplementalPageTable::remove_entry(spt, entry.base + i * config::PAGE_SIZE);
		}
		Ok(())
	}
}

impl Default for MmapTable {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::thread::Tid;

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
			7
		}
	}

	#[test]
	fn create_spans_multiple_pages() {
		let spt = SupplementalPageTable::new(1 as Tid);
		let table = MmapTable::new();
		let file: Arc<dyn FileHandle + Send + Sync> = Arc::new(NullFile);
		let id = table
			.create(&spt, file, 0x1000, 0, config::PAGE_SIZE + 10, true)
			.unwrap();
		assert!(spt.find(0x1000));
		assert!(spt.find(0x1000 + config::PAGE_SIZE));
		assert_eq!(table.find(id), Some((0x1000, config::PAGE_SIZE + 10)));
	}

	#[test]
	fn duplicate_range_rejected() {
		let spt = SupplementalPageTable::new(1 as Tid);
		let table = MmapTable::new();
		let file: Arc<dyn FileHandle + Send + Sync> = Arc::new(NullFile);
		table.create(&spt, file.clone(), 0x2000, 0, 100, true).unwrap();
		let err = table.create(&spt, file, 0x2000, 0, 100, true).unwrap_err();
		assert_eq!(err, Error::DuplicateMapping);
	}

	#[test]
	fn remove_unknown_id_is_invalid_access() {
		let spt = SupplementalPageTable::new(1 as Tid);
		let table = MmapTable::new();
		assert_eq!(table.remove(&spt, 99).unwrap_err(), Error::InvalidAccess);
	}
}
