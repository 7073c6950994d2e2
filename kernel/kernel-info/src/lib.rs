//! # Kernel Boot Information
//!
//! The ABI-stable records the bootloader hands to the kernel, and the
//! target configuration constants the memory bootstrap is built against.
//!
//! * [`boot`] — the [`Environment`](boot::Environment) record, its
//!   version-1 payload, and the raw firmware memory-map description.
//! * [`memory`] — compile-time memory configuration (kernel pagesize,
//!   platform alignment, stack minimum).

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod boot;
pub mod memory;
