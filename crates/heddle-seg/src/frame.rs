//! Pinned node frames

use crate::addr::Addr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A node frame pinned in memory
///
/// A frame is the aligned byte region inside a segment that holds one
/// node. While a [`Frame`] handle exists the bytes stay resident; the tree
/// core shares handles through `Arc` and serializes byte access with the
/// embedded lock. Writers hold the frame lock only for the duration of a
/// single format primitive; cross-primitive consistency is the tree
/// lock's job, not the frame's.
#[derive(Debug)]
pub struct Frame {
    addr: Addr,
    buf: RwLock<Box<[u8]>>,
}

impl Frame {
    /// Create a zero-filled frame for the given address
    ///
    /// The buffer length is fixed by the address's size class.
    pub fn new(addr: Addr) -> Frame {
        Frame {
            addr,
            buf: RwLock::new(vec![0u8; addr.size()].into_boxed_slice()),
        }
    }

    /// The frame's segment address
    pub fn addr(&self) -> Addr {
        self.addr
    }

    /// The frame size in bytes
    pub fn size(&self) -> usize {
        self.addr.size()
    }

    /// Lock the frame bytes for reading
    pub fn bytes(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.buf.read().unwrap()
    }

    /// Lock the frame bytes for writing
    pub fn bytes_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.buf.write().unwrap()
    }
}
