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

//! Demand-paged virtual memory: swap, the global frame and shared tables,
//! per-process supplemental page tables and mmap tables, the page-fault
//! handler, and the allocator glue that ties them together (`spec.md` §2
//! components 2–8).

pub mod alloc;
pub mod fault;
pub mod frame;
pub mod mmap;
pub mod shared;
pub mod spt;
pub mod swap;

/// Identifies a physical frame, handed out by [`frame::FrameTable`].
///
/// A real kernel would use the frame's physical address; this core treats
/// physical memory as external-collaborator territory (`spec.md` §1) and
/// only needs a stable, comparable identity for the frame and shared
/// tables, so a monotonic counter stands in for the address.
pub type FrameId = usize;
