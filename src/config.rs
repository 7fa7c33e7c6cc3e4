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

//! Kernel tuning constants, and the boot-time configuration that can
//! override them.
//!
//! The defaults below are the values named in `spec.md` §6. A booting
//! kernel may override a subset of them from a small TOML blob handed down
//! alongside the command line (see [`Config::parse`], only available with
//! the `std` feature since `toml` needs an allocator-backed parser and a
//! bare boot environment would bake these in at build time instead, the way
//! the teacher's `config` crate does).

use serde::Deserialize;

/// Lowest thread priority.
pub const PRI_MIN: u8 = 0;
/// Priority assigned to a thread that doesn't request one explicitly.
pub const PRI_DEFAULT: u8 = 31;
/// Highest thread priority.
pub const PRI_MAX: u8 = 63;

/// Number of ticks a thread runs before the scheduler requests a yield.
pub const TIME_SLICE: u64 = 4;

/// Maximum distance, in bytes, below the faulting stack pointer at which a
/// not-present fault is still considered valid stack growth (a `push`-like
/// instruction touching one word below `esp`).
pub const MAX_PUSH: usize = 32;

/// Maximum number of stack pages a single thread may grow to.
pub const MAX_STACK_PAGES: usize = 2048;

/// Number of fractional bits in the Q17.14 fixed-point format used by the
/// MLFQS.
pub const FP_FRACTIONAL_BITS: u32 = 14;

/// Timer interrupt frequency, in Hz.
pub const TIMER_FREQ: u32 = 100;

/// Size of a sector on the swap block device, in bytes.
pub const BLOCK_SECTOR_SIZE: usize = 512;

/// Size of a virtual memory page, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Number of sectors making up one page on the swap device.
pub const PAGE_SECTORS: usize = PAGE_SIZE / BLOCK_SECTOR_SIZE;

fn default_pri_default() -> u8 {
	PRI_DEFAULT
}

fn default_time_slice() -> u64 {
	TIME_SLICE
}

fn default_max_stack_pages() -> usize {
	MAX_STACK_PAGES
}

fn default_timer_freq() -> u32 {
	TIMER_FREQ
}

/// Boot-time configuration, overriding the constants above where present.
///
/// Unset fields keep their `spec.md` default.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct Config {
	/// Selects the MLFQS scheduler instead of the priority-donation one.
	///
	/// Corresponds to the `-mlfqs` boot flag. Mutually exclusive with
	/// priority donation.
	#[serde(default)]
	pub mlfqs: bool,
	/// Default priority assigned to new threads.
	#[serde(default = "default_pri_default")]
	pub pri_default: u8,
	/// Ticks per time slice before a yield is requested.
	#[serde(default = "default_time_slice")]
	pub time_slice: u64,
	/// Per-thread stack page cap.
	#[serde(default = "default_max_stack_pages")]
	pub max_stack_pages: usize,
	/// Timer interrupt frequency, in Hz.
	#[serde(default = "default_timer_freq")]
	pub timer_freq: u32,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			mlfqs: false,
			pri_default: PRI_DEFAULT,
			time_slice: TIME_SLICE,
			max_stack_pages: MAX_STACK_PAGES,
			timer_freq: TIMER_FREQ,
		}
	}
}

#[cfg(feature = "std")]
impl Config {
	/// Parses a boot configuration from a TOML blob.
	///
	/// Any field absent from `src` keeps the `spec.md` default.
	pub fn parse(src: &str) -> Result<Self, toml::de::Error> {
		toml::from_str(src)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn defaults_match_spec() {
		let cfg = Config::default();
		assert!(!cfg.mlfqs);
		assert_eq!(cfg.pri_default, PRI_DEFAULT);
		assert_eq!(cfg.time_slice, TIME_SLICE);
		assert_eq!(cfg.max_stack_pages, MAX_STACK_PAGES);
	}

	#[cfg(feature = "std")]
	#[test]
	fn parse_overrides_mlfqs_only() {
		let cfg = Config::parse("mlfqs = true\n").unwrap();
		assert!(cfg.mlfqs);
		assert_eq!(cfg.pri_default, PRI_DEFAULT);
	}
}
