//! OS adapter and callback traits.

use std::{any::Any, sync::Arc};

use crate::{
    GuestCore, GuestEvent, TraceError, Va,
    arch::Registers,
    driver::{GuestDriver, GuestMemory, GuestTranslate},
};

/// A process identifier within the guest.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A kernel thread identifier.
///
/// Distinct kernel threads run on distinct kernel stacks, so the guest stack
/// pointer captured at a call-site hit uniquely keys the thread until the
/// call returns.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub Va);

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque per-call state produced by [`SyscallHandler::enter`] and handed
/// back to [`SyscallHandler::exit`].
pub type UserState = Box<dyn Any + Send>;

/// Callbacks attached to a traced kernel function.
///
/// `enter` runs at the call-site breakpoint, `exit` at the hijacked return.
/// Both run synchronously on the event-delivery thread and must not block.
/// The engine never interprets the state passed between them.
pub trait SyscallHandler<Driver>: Send + Sync
where
    Driver: GuestDriver,
{
    /// Invoked when the guest enters the traced function.
    fn enter(
        &self,
        vmi: &GuestCore<Driver>,
        event: &GuestEvent,
        pid: ProcessId,
        thread: ThreadId,
    ) -> Option<UserState>;

    /// Invoked when the traced function returns.
    ///
    /// Receives the state returned by the matching [`enter`] and is
    /// responsible for anything attached to it.
    ///
    /// [`enter`]: Self::enter
    fn exit(
        &self,
        vmi: &GuestCore<Driver>,
        event: &GuestEvent,
        pid: ProcessId,
        thread: ThreadId,
        state: Option<UserState>,
    );
}

/// A traced kernel symbol paired with its callbacks.
pub struct SyscallHook<Driver>
where
    Driver: GuestDriver,
{
    /// The kernel symbol implementing the system call.
    pub symbol: String,

    /// The callbacks to invoke on entry and return.
    pub handler: Arc<dyn SyscallHandler<Driver>>,
}

impl<Driver> SyscallHook<Driver>
where
    Driver: GuestDriver,
{
    /// Creates a new hook.
    pub fn new(symbol: impl Into<String>, handler: Arc<dyn SyscallHandler<Driver>>) -> Self {
        Self {
            symbol: symbol.into(),
            handler,
        }
    }
}

/// Operating-system specific knowledge about the guest.
pub trait GuestOs<Driver>
where
    Driver: GuestMemory + GuestTranslate,
{
    /// Locates the instruction immediately following the dispatch call in
    /// the guest's syscall entry handler.
    ///
    /// Resolved exactly once at startup; hijacked calls resume at this
    /// address.
    fn find_return_point(
        &self,
        vmi: &GuestCore<Driver>,
        registers: &Registers,
    ) -> Result<Va, TraceError>;
}
