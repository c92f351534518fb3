//! Persistent B+-tree core
//!
//! This crate provides the indexing substrate of an object-store
//! back-end: a B+-tree of fixed-geometry records stored in node frames
//! inside a persistent segment, with modifications captured
//! transactionally against an external write-ahead log.
//!
//! - **Node format**: the persistent frame layout behind a per-node-type
//!   vtable ([`format`])
//! - **Descriptor caches**: in-memory handles for live nodes with
//!   refcounts and a global LRU, and a fixed pool of tree descriptors
//!   ([`BtreeDomain`])
//! - **Operation engine**: every GET/PUT/DEL/ITER runs as a cooperative,
//!   restartable state machine with optimistic descent and pessimistic
//!   validation under the tree write lock ([`op`])
//! - **Transaction adaptor**: mutations report their dirtied byte spans to
//!   a [`CaptureSink`]; replaying captures reproduces the tree ([`txn`])
//!
//! # Design Philosophy
//!
//! - The phase enum *is* the design: no callback spaghetti, one state per
//!   tick, suspension points are plain `.await`s
//! - Descent is optimistic; sequence counters plus the height snapshot
//!   form an epoch the commit point re-validates
//! - The format never sees the capture API; it reports spans and the
//!   operation layer forwards them
//!
//! # Example
//!
//! ```rust,ignore
//! use heddle_btree::{Btree, BtreeDomain, Tx, MemoryCaptureSink, TreeOpts};
//! use heddle_seg::MemorySegment;
//!
//! # async fn example() -> heddle_btree::Result<()> {
//! let domain = BtreeDomain::new();
//! let seg = MemorySegment::new();
//! let tree = Btree::create(domain, seg, TreeOpts::new(10, 8, 8)).await?;
//!
//! let tx = Tx::new(MemoryCaptureSink::new());
//! tree.insert(b"00000001", b"abcdefgh", &tx).await?;
//! tx.commit();
//!
//! assert!(tree.lookup(b"00000001").await?.is_some());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod cache;
pub mod error;
/// Node formats and the per-node-type vtable
pub mod format;
/// The operation state machine
pub mod op;
mod registry;
/// Public tree handles and the domain
pub mod tree;
/// The transaction adaptor
pub mod txn;

pub use error::{BtreeError, BtreeErrorKind, Result};
pub use op::{CbResult, Cookie, OpFlags, OpStatus, Opcode, RecSlot, Record, SlotVal, MAX_TRIALS};
pub use registry::TREE_POOL_SIZE;
pub use tree::{Btree, BtreeDomain, TreeOpts, CLOSE_GRACE};
pub use txn::{CaptureSink, Credit, MemoryCaptureSink, NullSink, Tx};
