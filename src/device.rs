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

//! The external interfaces this core consumes (`spec.md` §6).
//!
//! The bootloader, interrupt dispatch, ELF loader, on-disk file system, and
//! syscall surface are all external collaborators. This core never touches
//! hardware directly: it reaches the outside world exclusively through the
//! traits below, the way the teacher isolates the MMU behind
//! `memory::vmem::VMem` (`kernel/src/memory/vmem.rs`).

use crate::error::KResult;
use core::fmt;

/// A monotonic tick source, ticking at [`crate::config::TIMER_FREQ`] Hz.
pub trait TickSource {
	/// Returns the number of ticks elapsed since boot.
	fn now(&self) -> u64;
}

/// Control over whether the current core accepts interrupts.
///
/// Short, non-suspending critical sections (scheduler state, donation
/// propagation, `spec.md` §5) disable interrupts for their duration instead
/// of taking a lock.
pub trait InterruptControl: Sync {
	/// Returns whether interrupts are currently enabled on this core.
	fn is_enabled(&self) -> bool;
	/// Disables interrupts, returning the previous state.
	fn disable(&self) -> bool;
	/// Restores interrupts to `prev`, as returned by a prior [`Self::disable`].
	fn restore(&self, prev: bool);
}

/// A byte-addressable block device, addressed in units of
/// [`crate::config::BLOCK_SECTOR_SIZE`].
///
/// The swap manager is the only consumer of this trait in this core.
pub trait BlockDevice {
	/// Total number of sectors on the device.
	fn sector_count(&self) -> usize;
	/// Reads sector `sector` into `buf`, which must be exactly
	/// `BLOCK_SECTOR_SIZE` bytes.
	fn read_sector(&self, sector: usize, buf: &mut [u8]) -> KResult<()>;
	/// Writes `buf`, which must be exactly `BLOCK_SECTOR_SIZE` bytes, to
	/// sector `sector`.
	fn write_sector(&self, sector: usize, buf: &[u8]) -> KResult<()>;
}

/// An opaque, already-open file handle.
///
/// Every operation is taken under a single global filesystem lock by the
/// caller (`spec.md` §5); implementors need not be internally
/// synchronized.
pub trait FileHandle: fmt::Debug {
	/// Reads up to `buf.len()` bytes starting at `offset`, returning the
	/// number of bytes actually read (short on EOF).
	fn read_at(&self, offset: u64, buf: &mut [u8]) -> KResult<usize>;
	/// Writes `buf` at `offset`, returning the number of bytes written.
	fn write_at(&self, offset: u64, buf: &[u8]) -> KResult<usize>;
	/// Returns the file's length in bytes.
	fn len(&self) -> KResult<u64>;
	/// Tells whether the file is currently open for writing.
	fn is_writable(&self) -> bool;
	/// A stable identity for the underlying file, used as half of the
	/// [`crate::vm::shared`] table's key.
	///
	/// Two handles referring to the same underlying file (e.g. from two
	/// processes executing the same binary) must return the same identity.
	fn identity(&self) -> u64;
}

/// The page directory (page table) of a single address space.
///
/// Install/destroy/accessed-dirty accounting only; the core never walks
/// page table entries itself.
pub trait PageDirectory {
	/// Installs a mapping from user page `upage` to physical frame `kpage`.
	///
	/// `upage` and `kpage` are page-aligned addresses. Returns an error if
	/// the underlying page-table allocation fails.
	fn install(&mut self, upage: usize, kpage: usize, writable: bool) -> KResult<()>;
	/// Removes the mapping for `upage`, if any.
	fn destroy(&mut self, upage: usize);
	/// Returns `true` if `upage` is currently mapped.
	fn is_mapped(&self, upage: usize) -> bool;
	/// Returns and clears the hardware accessed bit for `upage`.
	fn take_accessed(&mut self, upage: usize) -> bool;
	/// Returns and clears the hardware dirty bit for `upage`.
	fn take_dirty(&mut self, upage: usize) -> bool;
	/// Sets the accessed bit for `upage` without clearing it.
	fn set_accessed(&mut self, upage: usize, value: bool);
	/// Sets the dirty bit for `upage` without clearing it.
	fn set_dirty(&mut self, upage: usize, value: bool);
}
