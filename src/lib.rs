//! Core resource managers of the kernel.
//!
//! This crate holds the two foundational, concurrently-shared resource
//! managers everything else in the kernel is built on: the disk block
//! [buffer cache](bcache) used by the file system, and the [physical page
//! allocator](palloc) used by the virtual memory layer. The two are
//! independent; neither calls the other.
//!
//! The crate is freestanding. Collaborators the kernel proper supplies (the
//! block device, the timer tick counter) enter through the seams defined
//! here, which is also what makes the whole crate testable from a host.

#![no_std]

pub mod bcache;
pub mod error;
pub mod palloc;
