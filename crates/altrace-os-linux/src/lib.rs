//! Linux guest adapter.
//!
//! Provides the Linux-specific knowledge the tracing engine needs: locating
//! the instruction after the dispatch call in `entry_SYSCALL_64`, and a
//! default table of traced system-call symbols with logging handlers.

mod amd64;
mod hooks;

use altrace_core::{
    GuestCore, GuestMemory, GuestOs, GuestTranslate, TraceError, Va, arch::Registers,
};
pub use hooks::{SyscallLogger, standard_hooks};

/// Linux-specific operations for the tracing engine.
///
/// The adapter is stateless; everything it knows is derived from the
/// syscall-entry MSR of the running guest.
#[derive(Debug, Default)]
pub struct LinuxOs;

impl LinuxOs {
    /// Creates a new Linux adapter.
    pub fn new() -> Self {
        Self
    }
}

impl<Driver> GuestOs<Driver> for LinuxOs
where
    Driver: GuestMemory + GuestTranslate,
{
    fn find_return_point(
        &self,
        vmi: &GuestCore<Driver>,
        registers: &Registers,
    ) -> Result<Va, TraceError> {
        amd64::find_return_point(vmi, registers)
    }
}
