//! Default system-call hooks for Linux guests.

use std::sync::Arc;

use altrace_core::{
    GuestCore, GuestDriver, GuestEvent, Hex, ProcessId, SyscallHandler, SyscallHook, ThreadId,
    UserState,
};

/// System calls traced by [`standard_hooks`].
///
/// Symbols that the running kernel does not export are skipped at
/// registration time, so the list can span kernel generations.
const STANDARD_SYMBOLS: &[&str] = &[
    "sys_open",
    "sys_openat",
    "sys_read",
    "sys_write",
    "sys_close",
    "sys_execve",
    "sys_clone",
    "sys_fork",
    "sys_unlink",
    "sys_exit_group",
];

/// Arguments captured when the guest enters a system call.
struct CallArgs {
    rdi: u64,
    rsi: u64,
    rdx: u64,
}

/// A handler that logs system-call entry and return through `tracing`.
///
/// The entry arguments are captured as the per-call state and logged
/// together with the return value, so each line pairs a completed call with
/// its result.
pub struct SyscallLogger {
    name: &'static str,
}

impl SyscallLogger {
    /// Creates a logger for the named system call.
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl<Driver> SyscallHandler<Driver> for SyscallLogger
where
    Driver: GuestDriver,
{
    fn enter(
        &self,
        _vmi: &GuestCore<Driver>,
        event: &GuestEvent,
        pid: ProcessId,
        thread: ThreadId,
    ) -> Option<UserState> {
        let registers = event.registers();

        tracing::debug!(
            syscall = self.name,
            %pid,
            %thread,
            "enter"
        );

        Some(Box::new(CallArgs {
            rdi: registers.rdi,
            rsi: registers.rsi,
            rdx: registers.rdx,
        }))
    }

    fn exit(
        &self,
        _vmi: &GuestCore<Driver>,
        event: &GuestEvent,
        pid: ProcessId,
        thread: ThreadId,
        state: Option<UserState>,
    ) {
        let result = event.registers().rax as i64;

        match state.and_then(|state| state.downcast::<CallArgs>().ok()) {
            Some(args) => tracing::info!(
                syscall = self.name,
                %pid,
                %thread,
                rdi = %Hex(args.rdi),
                rsi = %Hex(args.rsi),
                rdx = %Hex(args.rdx),
                result,
                "return"
            ),
            None => tracing::info!(syscall = self.name, %pid, %thread, result, "return"),
        }
    }
}

/// Returns the default hook table for a Linux guest.
pub fn standard_hooks<Driver>() -> Vec<SyscallHook<Driver>>
where
    Driver: GuestDriver,
{
    STANDARD_SYMBOLS
        .iter()
        .map(|name| {
            let handler: Arc<dyn SyscallHandler<Driver>> = Arc::new(SyscallLogger::new(name));
            SyscallHook::new(*name, handler)
        })
        .collect()
}
