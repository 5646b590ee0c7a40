// src/kernel/core/result.rs
//! Kernel-wide error handling.
//!
//! Errors carry an optional static context string so a failure deep in the
//! paging code still tells you which operation tripped it.

use core::fmt;

/// Kernel result type.
pub type KernelResult<T> = Result<T, KernelError>;

/// A kernel error with optional context.
#[derive(Debug, Clone)]
pub struct KernelError {
    kind: ErrorKind,
    context: Option<&'static str>,
}

impl KernelError {
    /// Create a new error.
    #[inline]
    pub const fn new(kind: ErrorKind) -> Self {
        Self { kind, context: None }
    }

    /// Create an error with context.
    #[inline]
    pub const fn with_context(kind: ErrorKind, ctx: &'static str) -> Self {
        Self { kind, context: Some(ctx) }
    }

    /// The error kind.
    #[inline]
    pub const fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The context string, if any.
    #[inline]
    pub const fn context(&self) -> Option<&'static str> {
        self.context
    }

    /// Whether this is a memory error.
    #[inline]
    pub const fn is_memory_error(&self) -> bool {
        matches!(self.kind, ErrorKind::Memory(_))
    }

    /// Whether this is an out-of-memory condition.
    #[inline]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self.kind, ErrorKind::Memory(MemoryError::OutOfMemory))
    }
}

impl From<ErrorKind> for KernelError {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<MemoryError> for KernelError {
    #[inline]
    fn from(e: MemoryError) -> Self {
        Self::new(ErrorKind::Memory(e))
    }
}

impl From<TaskError> for KernelError {
    #[inline]
    fn from(e: TaskError) -> Self {
        Self::new(ErrorKind::Task(e))
    }
}

/// Error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Device error
    Device(DeviceError),
    /// Memory error
    Memory(MemoryError),
    /// Task/process error
    Task(TaskError),
    /// Invalid argument
    InvalidArgument,
    /// Resource temporarily unavailable
    ResourceUnavailable,
    /// Not implemented
    NotImplemented,
}

/// Device errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// Initialization failed
    InitFailed,
    /// I/O error
    IoError,
}

/// Memory-management errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// Out of physical memory
    OutOfMemory,
    /// Address outside the valid user range, or otherwise malformed
    InvalidAddress,
    /// Address not aligned as required
    MisalignedAccess,
    /// Range overlaps an existing mapping
    Overlap,
    /// Page is already mapped
    AlreadyMapped,
    /// Write to a genuinely read-only user page
    PermissionDenied,
}

/// Process/task errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// No such process
    NotFound,
    /// Process table is full
    TableFull,
    /// The caller has no children to wait for
    NoChild,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::Device(e) => write!(f, "device error: {:?}", e)?,
            ErrorKind::Memory(e) => write!(f, "memory error: {:?}", e)?,
            ErrorKind::Task(e) => write!(f, "task error: {:?}", e)?,
            ErrorKind::InvalidArgument => write!(f, "invalid argument")?,
            ErrorKind::ResourceUnavailable => write!(f, "resource unavailable")?,
            ErrorKind::NotImplemented => write!(f, "not implemented")?,
        }
        if let Some(ctx) = self.context {
            write!(f, " ({})", ctx)?;
        }
        Ok(())
    }
}
