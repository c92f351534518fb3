//! Segment addressing and frame storage for the heddle B+-tree
//!
//! A heddle tree lives inside a *segment*: a contiguous region of
//! persistent address space backed by a pager. This crate provides the
//! pieces of that world the tree core consumes:
//!
//! - **Packed addresses** ([`Addr`]): a single `u64` carrying both a frame
//!   pointer and the node's size class.
//! - **Frames** ([`Frame`]): aligned byte regions inside a segment, sized
//!   to a node, pinned in memory while in use.
//! - **The pager interface** ([`Segment`]): aligned frame allocation,
//!   frame pinning and frame free, as an async trait so that a real
//!   implementation can suspend on I/O.
//! - **An in-memory implementation** ([`MemorySegment`]) used by tests,
//!   capture replay, and small deployments.
//!
//! The tree core never touches segment internals beyond this surface.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod addr;
pub mod error;
pub mod frame;
pub mod memory;
pub mod segment;

pub use addr::{Addr, MAX_SHIFT, MIN_SHIFT};
pub use error::{Result, SegError};
pub use frame::Frame;
pub use memory::MemorySegment;
pub use segment::Segment;
