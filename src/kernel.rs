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

//! Core of a teaching-grade kernel: a priority-donating thread scheduler and a
//! demand-paged virtual memory subsystem.
//!
//! This crate is the part of the kernel that owns the hard concurrency and
//! paging invariants. It does not boot anything by itself: the bootloader,
//! interrupt dispatch, ELF loading, on-disk file system, and syscall surface
//! are external collaborators reached only through the traits in [`device`].
//!
//! # Layout
//!
//! - [`fixed_point`]: Q17.14 fixed-point arithmetic used by the MLFQS.
//! - [`thread`]: thread identity, state, and the donation-aware
//!   synchronization primitives ([`thread::sync_prim`]).
//! - [`scheduler`]: the ready queue and tick handling, in priority or MLFQS
//!   mode.
//! - [`vm`]: supplemental page table, frame table, swap manager, mmap table,
//!   shared table, and the page-fault handler that composes them.
//! - [`device`]: the external interfaces this core consumes.
//! - [`error`], [`logger`], [`config`], [`sync`]: ambient kernel plumbing.

#![no_std]
#![allow(clippy::tabs_in_doc_comments)]
#![allow(dead_code)]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod config;
pub mod device;
pub mod error;
pub mod fixed_point;
pub mod logger;
pub mod scheduler;
pub mod sync;
pub mod thread;
pub mod vm;
