//! # altrace
//!
//! Stealthy system-call tracing for unmodified guests, built on the
//! hypervisor's alternate second-level address translation (alt-p2m)
//! facility.
//!
//! The engine never writes a breakpoint into memory the guest can see.
//! Every instrumented kernel-code frame is copied into a freshly allocated
//! *shadow frame*; the breakpoint opcodes live only in the copy, which the
//! shadow view maps in place of the original. Guest reads and writes of an
//! instrumented page — a kernel integrity check, say — trap and are
//! replayed against the clean bytes through the default view, one
//! instruction at a time.
//!
//! A traced call runs through a small per-VCPU state machine:
//!
//! 1. The guest enters a traced kernel function and executes the emplaced
//!    breakpoint. The engine invokes the entry callback, swaps the return
//!    slot on the guest stack for the address of a breakpoint byte that is
//!    already part of the kernel image (the *trampoline*), and steps the
//!    VCPU over the original instruction in the default view.
//! 2. The function returns into the trampoline. The engine invokes the exit
//!    callback with the state the entry callback produced, then points the
//!    VCPU back at the instruction after the original call site.
//!
//! Each pending call is keyed by the guest stack pointer at the call site:
//! distinct kernel threads run on distinct kernel stacks, so concurrent
//! calls on different VCPUs never collide.
//!
//! # Quick start
//!
//! The hypervisor side lives behind the [`FullGuestDriver`] trait family;
//! bring a driver, pick an OS adapter, attach hooks and run:
//!
//! ```ignore
//! let vmi = GuestCore::new(driver);
//! let mut tracer = Tracer::new(vmi, LinuxOs::new())?;
//!
//! tracer.attach_all(altrace::os::linux::standard_hooks());
//!
//! // Terminating signals raise the engine's flag for an orderly teardown.
//! let flag = tracer.terminate_flag();
//! signal_hook::flag::register(signal_hook::consts::SIGINT, flag.clone())?;
//! signal_hook::flag::register(signal_hook::consts::SIGTERM, flag)?;
//!
//! tracer.run()?;
//! ```
//!
//! Teardown restores the guest byte-exactly: every shadow mapping is
//! removed, every hijacked return slot is rewritten to the real return
//! point, and the physical-frame reservation is returned to its initial
//! size.

mod calls;
mod shadow;
mod tracer;
mod trampoline;

pub use altrace_core::{
    EventInterrupt, EventMemoryAccess, EventMonitor, EventReason, EventResponse,
    EventResponseFlags, EventSinglestep, FullGuestDriver, Gfn, GuestCore, GuestDriver, GuestEvent,
    GuestEvents, GuestInfo, GuestMemory, GuestOs, GuestPhysmap, GuestRegisters, GuestTranslate,
    GuestViews, GuestVmControl, Hex, MemoryAccess, OsKind, Pa, PageFaults, PauseGuard, ProcessId,
    SyscallHandler, SyscallHook, ThreadId, TraceError, UserState, Va, VcpuId, View, arch,
};
pub use tracer::Tracer;

/// OS adapters for supported guests.
pub mod os {
    #[cfg(feature = "os-linux")]
    pub use altrace_os_linux as linux;
}

#[cfg(test)]
mod tracer_tests;
