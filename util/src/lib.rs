//! Freestanding utility types shared across the kernel.

#![no_std]

pub mod cell;
pub mod sync;
