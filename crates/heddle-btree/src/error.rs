//! Error types for tree operations

use heddle_seg::SegError;
use std::error::Error;
use std::fmt;

/// Boxed error type for error sources
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Result type alias for tree operations
pub type Result<T> = std::result::Result<T, BtreeError>;

/// Tree operation error with rich diagnostics
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub struct BtreeError {
    kind: BtreeErrorKind,
    #[source]
    source: Option<BoxError>,
    #[help]
    help: Option<String>,
    context: Option<String>,
}

/// Error categories for tree operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtreeErrorKind {
    /// Context, level-stack or descriptor allocation failed
    NoMemory,
    /// A child pointer read from a frame is outside the segment
    BadAddress,
    /// A node failed header or footer validation on load
    BadFormat,
    /// Optimistic restarts exhausted with whole-tree locking already on
    RetryExhausted,
    /// Access to a node whose frame free has been delayed
    NodeBusy,
    /// The caller's callback returned an error
    Callback,
    /// Close found straggling active nodes after the grace period
    CloseTimeout,
    /// The tree descriptor pool is full
    PoolFull,
    /// A key of the wrong length for the tree
    InvalidKey,
    /// Destroy called on a non-empty tree
    NotEmpty,
    /// Segment or pager failure
    Storage,
}

impl BtreeError {
    /// Create a new error with the given kind and optional source
    pub fn new(kind: BtreeErrorKind, source: Option<BoxError>) -> Self {
        Self {
            kind,
            source,
            help: None,
            context: None,
        }
    }

    /// Add a help message to the error
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Add context information to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Get the error kind
    pub fn kind(&self) -> BtreeErrorKind {
        self.kind
    }

    // Constructors for different error kinds

    /// Create a no-memory error
    pub fn no_memory(what: &str) -> Self {
        Self::new(BtreeErrorKind::NoMemory, None)
            .with_context(format!("allocation failed: {}", what))
    }

    /// Create a bad-address error
    pub fn bad_address(addr: u64) -> Self {
        Self::new(BtreeErrorKind::BadAddress, None)
            .with_context(format!("child pointer {:#018x} is outside the segment", addr))
            .with_help("the frame holding this pointer is likely corrupt")
    }

    /// Create a bad-format error
    pub fn bad_format(addr: u64) -> Self {
        Self::new(BtreeErrorKind::BadFormat, None)
            .with_context(format!("node at {:#018x} failed format validation", addr))
    }

    /// Create a retry-exhausted error
    pub fn retry_exhausted(trials: u32) -> Self {
        Self::new(BtreeErrorKind::RetryExhausted, None)
            .with_context(format!("{} validation failures under whole-tree lock", trials))
    }

    /// Create a node-busy error
    pub fn node_busy(addr: u64) -> Self {
        Self::new(BtreeErrorKind::NodeBusy, None)
            .with_context(format!("node {:#018x} is pending a delayed free", addr))
            .with_help("restart the operation; the frame is being torn down")
    }

    /// Wrap a callback error
    pub fn callback(source: BoxError) -> Self {
        Self::new(BtreeErrorKind::Callback, Some(source))
    }

    /// Create a close-timeout error
    pub fn close_timeout(active: usize) -> Self {
        Self::new(BtreeErrorKind::CloseTimeout, None)
            .with_context(format!("{} nodes still active after grace period", active))
            .with_help("an operation is leaking node references; the tree stays open")
    }

    /// Create a pool-full error
    pub fn pool_full(max: usize) -> Self {
        Self::new(BtreeErrorKind::PoolFull, None)
            .with_context(format!("all {} tree descriptor slots are claimed", max))
    }

    /// Create an invalid-key error
    pub fn invalid_key(len: usize, want: usize) -> Self {
        Self::new(BtreeErrorKind::InvalidKey, None)
            .with_context(format!("buffer is {} bytes, tree expects {}", len, want))
    }

    /// Create a not-empty error
    pub fn not_empty(records: u64) -> Self {
        Self::new(BtreeErrorKind::NotEmpty, None)
            .with_context(format!("tree still holds {} records", records))
            .with_help("destroy requires an empty root")
    }

    /// Create a storage error
    pub fn storage(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(BtreeErrorKind::Storage, Some(Box::new(source)))
    }
}

impl fmt::Display for BtreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;

        if let Some(ctx) = &self.context {
            write!(f, ": {}", ctx)?;
        }

        if let Some(src) = &self.source {
            write!(f, ": {}", src)?;
        }

        Ok(())
    }
}

impl From<SegError> for BtreeError {
    fn from(e: SegError) -> Self {
        match &e {
            SegError::InvalidAddress { addr } | SegError::Unmapped { addr } => {
                let addr = *addr;
                Self::new(BtreeErrorKind::BadAddress, Some(Box::new(e)))
                    .with_context(format!("segment rejected address {:#018x}", addr))
            }
            SegError::Exhausted { .. } => Self::new(BtreeErrorKind::NoMemory, Some(Box::new(e))),
            _ => BtreeError::storage(e),
        }
    }
}

// Internal granular errors

/// Node-format errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum FormatError {
    /// Header magic or version mismatch
    #[error("bad header magic {found:#010x}")]
    BadMagic {
        /// The magic value found in the frame
        found: u32,
    },

    /// Footer checksum mismatch
    #[error("footer checksum mismatch")]
    BadChecksum,

    /// Node geometry cannot host a single record
    #[error("geometry unusable: {ksize}+{vsize} byte records in a {size} byte node")]
    Unusable {
        /// Key size
        ksize: u16,
        /// Value size
        vsize: u16,
        /// Node size
        size: usize,
    },

    /// No format registered for the node-type id
    #[error("unknown node type {ntype}")]
    UnknownType {
        /// The node-type id
        ntype: u32,
    },
}

impl From<FormatError> for BtreeError {
    fn from(e: FormatError) -> Self {
        BtreeError::new(BtreeErrorKind::BadFormat, Some(Box::new(e)))
    }
}
