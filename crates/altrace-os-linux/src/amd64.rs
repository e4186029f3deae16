//! Syscall-entry analysis for AMD64 Linux guests.

use altrace_core::{
    GuestCore, GuestMemory, GuestTranslate, TraceError, Va,
    arch::{self, Registers},
};

/// Opcode of the near relative `CALL` instruction.
const CALL_NEAR_RELATIVE: u8 = 0xe8;

/// Maximum plausible displacement of the dispatch call.
///
/// The kernel text section fits well within this window, so a larger
/// displacement means the `0xe8` byte was part of another instruction.
const MAX_DISPLACEMENT: i64 = 32 * 1024 * 1024;

/// Locates the instruction after the dispatch call in `entry_SYSCALL_64`.
///
/// The entry handler is anchored by `MSR_LSTAR`; the handler saves user
/// state and dispatches through a near call (`call do_syscall_64` on every
/// kernel this adapter supports). Every traced system call returns into the
/// instruction that follows that call.
pub(crate) fn find_return_point<Driver>(
    vmi: &GuestCore<Driver>,
    registers: &Registers,
) -> Result<Va, TraceError>
where
    Driver: GuestMemory + GuestTranslate,
{
    let entry = Va(registers.msr_lstar);

    let mut code = vec![0u8; arch::PAGE_SIZE as usize];
    vmi.read_kernel(entry, &mut code)?;

    match find_dispatch_call(&code) {
        Some(end) => {
            let return_point = entry + end as u64;
            tracing::debug!(%entry, %return_point, "located syscall dispatch return point");
            Ok(return_point)
        }
        None => Err(TraceError::ReturnPointNotFound),
    }
}

/// Returns the offset of the instruction following the first plausible near
/// call in `code`.
fn find_dispatch_call(code: &[u8]) -> Option<usize> {
    for index in memchr::memchr_iter(CALL_NEAR_RELATIVE, code) {
        let bytes: [u8; 4] = match code.get(index + 1..index + 5) {
            Some(bytes) => bytes.try_into().ok()?,
            None => break,
        };

        let displacement = i32::from_le_bytes(bytes) as i64;

        // A zero displacement is a call to the next instruction; stray
        // `0xe8` bytes inside other instructions produce displacements far
        // outside the kernel text window.
        if displacement != 0 && displacement.abs() <= MAX_DISPLACEMENT {
            return Some(index + 5);
        }
    }

    None
}
