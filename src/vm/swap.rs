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

//! The swap manager: a bitmap of free page-sized slots on a block device
//! (`spec.md` §4.4).
//!
//! Grounded on `original_source/src/vm/swap.c`: `find_swap_space` is a
//! first-fit scan-and-flip over a sector bitmap, `remove_swap_space` frees
//! a slot's sectors, and `swap_write_frame`/`swap_read_frame` move exactly
//! one page (`PAGE_SECTORS` consecutive sectors) per call. `swap_read_file`
//! (declared in `swap.h`, used from `page.c`'s `spt_destroy_entry`) streams
//! a swapped page straight into its backing file instead of through a
//! caller-supplied buffer, for restoring a dirty file-backed page at
//! process teardown without allocating a whole page just to discard most
//! of it.

use crate::{
	config,
	device::{BlockDevice, FileHandle},
	error::{Error, KResult},
	sync::mutex::Mutex,
};
use alloc::vec::Vec;

struct SwapTable {
	device: &'static dyn BlockDevice,
	/// One bit per page-sized slot; `true` means free.
	free: Vec<bool>,
}

impl SwapTable {
	fn new(device: &'static dyn BlockDevice) -> Self {
		let slots = device.sector_count() / config::PAGE_SECTORS;
		Self {
			device,
			free: alloc::vec![true; slots],
		}
	}

	fn allocate(&mut self) -> KResult<usize> {
		let index = self.free.iter().position(|&free| free).ok_or(Error::OutOfSwap)?;
		self.free[index] = false;
		Ok(index)
	}

	fn release(&mut self, index: usize) {
		if let Some(slot) = self.free.get_mut(index) {
			*slot = true;
		}
	}

	fn write_page(&self, buffer: &[u8; config::PAGE_SIZE], index: usize) -> KResult<()> {
		let base = index * config::PAGE_SECTORS;
		for i in 0..config::PAGE_SECTORS {
			let start = i * config::BLOCK_SECTOR_SIZE;
			let end = start + config::BLOCK_SECTOR_SIZE;
			self.device.write_sector(base + i, &buffer[start..end])?;
		}
		Ok(())
	}

	fn read_page(&self, buffer: &mut [u8; config::PAGE_SIZE], index: usize) -> KResult<()> {
		let base = index * config::PAGE_SECTORS;
		for i in 0..config::PAGE_SECTORS {
			let start = i * config::BLOCK_SECTOR_SIZE;
			let end = start + config::BLOCK_SECTOR_SIZE;
			self.device.read_sector(base + i, &mut buffer[start..end])?;
		}
		Ok(())
	}
}

#[cfg(not(test))]
static SWAP_TABLE: crate::sync::once::OnceInit<Mutex<SwapTable>> =
	unsafe { crate::sync::once::OnceInit::new() };

/// Initializes the swap manager over `device`.
///
/// Must be called exactly once, before any other function in this module.
#[cfg(not(test))]
pub fn init(device: &'static dyn BlockDevice) {
	unsafe {
		crate::sync::once::OnceInit::init(&SWAP_TABLE, Mutex::new(SwapTable::new(device)));
	}
}

#[cfg(not(test))]
fn table() -> &'static Mutex<SwapTable> {
	&SWAP_TABLE
}

#[cfg(test)]
fn table() -> &'static Mutex<SwapTable> {
	test_support::table()
}

/// Reserves one free page-sized slot, failing with [`Error::OutOfSwap`] if
/// the device is full.
pub fn allocate() -> KResult<usize> {
	table().lock().allocate()
}

/// Frees slot `index`. Idempotent: freeing an already-free slot is a no-op.
pub fn release(index: usize) -> KResult<()> {
	table().lock().release(index);
	Ok(())
}

/// Writes one page's worth of data to slot `index`.
pub fn write_page(buffer: &[u8; config::PAGE_SIZE], index: usize) -> KResult<()> {
	table().lock().write_page(buffer, index)
}

/// Reads slot `index` into `buffer`.
pub fn read_page(buffer: &mut [u8; config::PAGE_SIZE], index: usize) -> KResult<()> {
	table().lock().read_page(buffer, index)
}

/// Streams the first `bytes` of slot `index` into `file` at `offset`,
/// without keeping a whole page alive just to write back a short tail
/// (`swap_read_file`, used when a dirty file-backed page is torn down
/// while still in swap).
pub fn read_page_to_file(file: &dyn FileHandle, index: usize, bytes: usize, offset: u64) -> KResult<()> {
	let mut page = [0u8; config::PAGE_SIZE];
	table().lock().read_page(&mut page, index)?;
	let bytes = bytes.min(config::PAGE_SIZE);
	file.write_at(offset, &page[..bytes])?;
	Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
	use super::*;
	use alloc::boxed::Box;
	use std::cell::Cell;

	thread_local! {
		static CURRENT: Cell<Option<&'static Mutex<SwapTable>>> = const { Cell::new(None) };
	}

	pub(crate) fn table() -> &'static Mutex<SwapTable> {
		CURRENT
			.with(|c| c.get())
			.expect("call within `swap::test_support::with_swap_table`")
	}

	/// A `BlockDevice` backed by a plain in-memory buffer, for tests.
	pub(crate) struct MemoryBlockDevice {
		sectors: Mutex<Vec<[u8; config::BLOCK_SECTOR_SIZE]>>,
	}

	impl MemoryBlockDevice {
		pub(crate) fn new(sector_count: usize) -> Self {
			Self {
				sectors: Mutex::new(alloc::vec![[0; config::BLOCK_SECTOR_SIZE]; sector_count]),
			}
		}
	}

	impl BlockDevice for MemoryBlockDevice {
		fn sector_count(&self) -> usize {
			self.sectors.lock().len()
		}

		fn read_sector(&self, sector: usize, buf: &mut [u8]) -> KResult<()> {
			buf.copy_from_slice(&self.sectors.lock()[sector]);
			Ok(())
		}

		fn write_sector(&self, sector: usize, buf: &[u8]) -> KResult<()> {
			self.sectors.lock()[sector].copy_from_slice(buf);
			Ok(())
		}
	}

	pub(crate) fn with_swap_table<R>(sector_count: usize, body: impl FnOnce() -> R) -> R {
		let device: &'static MemoryBlockDevice = Box::leak(Box::new(MemoryBlockDevice::new(sector_count)));
		let leaked: &'static Mutex<SwapTable> = Box::leak(Box::new(Mutex::new(SwapTable::new(device))));
		CURRENT.with(|c| c.set(Some(leaked)));
		body()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use test_support::with_swap_table;

	#[test]
	fn allocate_then_release_reuses_slot() {
		with_swap_table(config::PAGE_SECTORS * 2, || {
			let a = allocate().unwrap();
			release(a).unwrap();
			let b = allocate().unwrap();
			assert_eq!(a, b);
		});
	}

	#[test]
	fn out_of_swap_when_full() {
		with_swap_table(config::PAGE_SECTORS, || {
			allocate().unwrap();
			assert!(matches!(allocate(), Err(Error::OutOfSwap)));
		});
	}

	#[test]
	fn write_then_read_round_trips() {
		with_swap_table(config::PAGE_SECTORS * 2, || {
			let slot = allocate().unwrap();
			let mut page = [0u8; config::PAGE_SIZE];
			page[0] = 0xAB;
			page[config::PAGE_SIZE - 1] = 0xCD;
			write_page(&page, slot).unwrap();
			let mut out = [0u8; config::PAGE_SIZE];
			read_page(&mut out, slot).unwrap();
			assert_eq!(page, out);
		});
	}
}
