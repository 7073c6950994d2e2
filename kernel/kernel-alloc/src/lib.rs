//! # Kernel Memory Allocation
//!
//! This crate composes the kernel's general-purpose allocator out of the
//! free memory left over after boot, and builds it before any allocator
//! exists: every piece of bookkeeping lives in memory that the bookkeeping
//! itself describes.
//!
//! ## Architecture Overview
//!
//! The allocator stack is three resources deep:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Buddy Resource                      │
//! │    • power-of-two blocks, split and combine         │
//! │    • per-block header with free/half bits           │
//! │    • never returns sub-top-level memory upstream    │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │               Distributed Resource                  │
//! │    • fans requests out over many upstreams          │
//! │    • tags each block with its upstream index        │
//! │    • routes deallocation by the recovered tag       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │        Monotonic Buffers (one per fragment)         │
//! │    • bump allocation over a fixed free span         │
//! │    • no deallocation, no upstream                   │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Bootstrap
//!
//! [`MemoryManager::build`] turns a sanitised memory map and a sorted list
//! of occupied regions into the stack above:
//!
//! 1. every occupied region is checked against the map,
//! 2. regions are carved out of free memory for the map copy, the occupied
//!    list copy, the internal resource objects, and the fragment array —
//!    each placement seeing the previous ones as occupied,
//! 3. the final collections are rebuilt into their dedicated monotonic
//!    buffers,
//! 4. the residual free fragments become one monotonic buffer each, the
//!    distributed resource fans out over them, and the buddy resource tops
//!    the stack.
//!
//! The result is a moveable, single-threaded [`MemoryManager`] whose
//! [`general_resource`](MemoryManager::general_resource) serves allocations
//! out of nothing but the firmware's free memory. This is the
//! pre-scheduler, unsynchronised variant; nothing in here may block.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buddy;
pub mod config;
pub mod distributed;
pub mod manager;

pub use buddy::{BuddyError, BuddyResource};
pub use distributed::DistributedResource;
pub use manager::{BuildError, GeneralResource, MemoryManager};
