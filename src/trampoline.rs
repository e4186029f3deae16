//! Return-site trampoline discovery.
//!
//! Rather than emplacing a second class of breakpoint bytes the guest might
//! checksum, the engine reuses a breakpoint opcode that is already part of
//! the kernel image near the syscall entry and unreachable in normal
//! execution. Hijacked return slots point at that byte.

use altrace_core::{
    GuestCore, GuestMemory, GuestTranslate, TraceError, Va,
    arch::{self, Registers},
};

/// Scans the syscall entry for a pre-existing breakpoint opcode.
///
/// Reads one page starting at the address held in the syscall-entry MSR and
/// returns the virtual address of the first breakpoint byte. Resolved
/// exactly once at startup.
pub(crate) fn locate<Driver>(
    vmi: &GuestCore<Driver>,
    registers: &Registers,
) -> Result<Va, TraceError>
where
    Driver: GuestMemory + GuestTranslate,
{
    let entry = Va(registers.msr_lstar);

    let mut code = vec![0u8; arch::PAGE_SIZE as usize];
    vmi.read_kernel(entry, &mut code)?;

    match memchr::memchr(arch::BREAKPOINT, &code) {
        Some(index) => {
            let trampoline = entry + index as u64;
            tracing::debug!(%entry, %trampoline, "located the return-site trampoline");
            Ok(trampoline)
        }
        None => Err(TraceError::TrampolineNotFound),
    }
}
