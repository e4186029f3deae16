use crate::Va;

/// An error that can occur while tracing a guest.
#[derive(thiserror::Error, Debug)]
pub enum TraceError {
    /// An error occurred in the hypervisor driver.
    #[error(transparent)]
    Driver(Box<dyn std::error::Error + Send + Sync>),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A translation error occurred.
    #[error("Translation error ({:?}, len: {})", .0[0], .0.len())]
    Translation(PageFaults),

    /// A kernel symbol could not be resolved.
    #[error("Unknown kernel symbol `{0}`")]
    Symbol(String),

    /// Alternate p2m views are not available on the domain.
    #[error("Alternate p2m views are not available")]
    AltP2mUnavailable,

    /// The view was not found.
    #[error("The view was not found")]
    ViewNotFound,

    /// The syscall entry page holds no breakpoint opcode to reuse.
    #[error("No breakpoint opcode in the syscall entry page")]
    TrampolineNotFound,

    /// The dispatch call in the syscall entry handler was not found.
    #[error("No dispatch call in the syscall entry handler")]
    ReturnPointNotFound,

    /// Timeout.
    #[error("Operation timed out")]
    Timeout,

    /// Teardown completed but one or more restoration steps failed.
    #[error("Teardown completed with warnings")]
    Teardown,

    /// Out of bounds.
    #[error("Out of bounds")]
    OutOfBounds,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}

/// A collection of page faults.
pub type PageFaults = smallvec::SmallVec<[Va; 1]>;

impl TraceError {
    /// Creates a new driver error.
    pub fn driver(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Driver(err.into())
    }

    /// Creates a new page fault error.
    pub fn page_fault(va: impl Into<Va>) -> Self {
        Self::Translation(smallvec::smallvec![va.into()])
    }
}
