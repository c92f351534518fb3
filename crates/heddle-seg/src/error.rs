//! Error types for segment operations

/// Result type alias for segment operations
pub type Result<T> = std::result::Result<T, SegError>;

/// Segment and frame errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum SegError {
    /// An address with non-zero reserved bits was built or decoded
    #[error("address {addr:#018x} has reserved bits set")]
    #[diagnostic(help("bits 4..9 and 56..64 of a segment address must be zero"))]
    InvalidAddress {
        /// The raw address value
        addr: u64,
    },

    /// A frame pointer that is not 512-byte aligned
    #[error("frame pointer {ptr:#018x} is not 512-byte aligned")]
    Misaligned {
        /// The offending pointer
        ptr: u64,
    },

    /// A size-class shift outside the supported range
    #[error("size-class shift {shift} outside [{min}, {max}]", min = crate::MIN_SHIFT, max = crate::MAX_SHIFT)]
    #[diagnostic(help("node sizes run from 512 B (shift 9) to 16 MB (shift 24)"))]
    BadShift {
        /// The offending shift
        shift: u8,
    },

    /// No frame is mapped at the given address
    #[error("no frame mapped at {addr:#018x}")]
    Unmapped {
        /// The raw address value
        addr: u64,
    },

    /// The allocator ran out of segment space
    #[error("segment exhausted: cannot allocate {size} bytes")]
    Exhausted {
        /// The requested frame size
        size: usize,
    },
}
