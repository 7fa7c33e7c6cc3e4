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

//! Error kinds distinguished by the core, and their propagation rules.
//!
//! Every fallible core operation returns [`KResult`]. Kernel-mode exceptions
//! (a null deref from kernel code, a corrupted table) are kernel bugs and
//! panic instead of returning an error here; this type is reserved for
//! conditions the caller is expected to handle (killing a process, retrying
//! eviction, returning a syscall error code).

use core::fmt;

/// An error produced by the scheduler or virtual memory core.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
	/// The frame pool is exhausted even after an eviction attempt.
	///
	/// Fatal to the current process.
	OutOfMemory,
	/// The swap area has no free slot left.
	///
	/// Fatal to the current process.
	OutOfSwap,
	/// A null access, an access to kernel-range memory, a write to a
	/// read-only page, a fault outside of any mapping that is not a valid
	/// stack-growth case, or a stack growth past `MAX_STACK_PAGES`.
	///
	/// Kills the current process with exit status -1.
	InvalidAccess,
	/// A block device or file system operation failed.
	///
	/// Fatal to the current process.
	IoError,
	/// Every frame in the frame table is pinned during eviction.
	///
	/// Fatal to the current process.
	AllPinned,
	/// `mmap` was asked to create a mapping over a page that is already
	/// mapped.
	///
	/// Not fatal: the syscall layer reports this as the `-1` sentinel.
	DuplicateMapping,
}

impl Error {
	/// Tells whether this error is fatal to the process that triggered it,
	/// i.e. whether the caller must synchronously terminate that process
	/// rather than merely propagate a return value.
	pub const fn is_fatal(self) -> bool {
		!matches!(self, Self::DuplicateMapping)
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::OutOfMemory => "out of memory",
			Self::OutOfSwap => "out of swap space",
			Self::InvalidAccess => "invalid memory access",
			Self::IoError => "I/O error",
			Self::AllPinned => "all frames pinned",
			Self::DuplicateMapping => "duplicate mapping",
		};
		f.write_str(s)
	}
}

/// Result type used throughout the core.
pub type KResult<T> = Result<T, Error>;

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn duplicate_mapping_is_not_fatal() {
		assert!(!Error::DuplicateMapping.is_fatal());
		assert!(Error::OutOfMemory.is_fatal());
		assert!(Error::AllPinned.is_fatal());
	}
}
