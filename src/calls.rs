//! The table of calls whose return slots are hijacked.

use std::{collections::HashMap, sync::Arc};

use altrace_core::{
    GuestCore, GuestDriver, GuestMemory, GuestTranslate, SyscallHandler, ThreadId, UserState, Va,
};

/// One pending call/return pair.
///
/// Exists from the call-site hit until the matching return-site hit, or
/// until shutdown — in which case the hijacked return slot on the guest
/// stack is restored so the kernel does not fall into a trampoline that is
/// no longer serviced.
pub(crate) struct CallInFlight<Driver>
where
    Driver: GuestDriver,
{
    /// Callbacks of the breakpoint that opened this call.
    pub handler: Arc<dyn SyscallHandler<Driver>>,

    /// Opaque state produced by the call callback.
    pub user_state: Option<UserState>,
}

/// Pending calls keyed by thread identifier.
pub(crate) struct CallTable<Driver>
where
    Driver: GuestDriver,
{
    calls: HashMap<ThreadId, CallInFlight<Driver>>,
}

impl<Driver> CallTable<Driver>
where
    Driver: GuestDriver,
{
    /// Creates an empty call table.
    pub fn new() -> Self {
        Self {
            calls: HashMap::new(),
        }
    }

    /// Returns the number of pending calls.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Registers a pending call.
    pub fn insert(&mut self, thread: ThreadId, call: CallInFlight<Driver>) {
        if self.calls.insert(thread, call).is_some() {
            // The same stack pointer can only repeat if the previous call
            // never returned through the trampoline; the stale record is
            // superseded.
            tracing::debug!(%thread, "replaced a stale pending call");
        }
    }

    /// Removes and returns the pending call for a thread.
    pub fn remove(&mut self, thread: ThreadId) -> Option<CallInFlight<Driver>> {
        self.calls.remove(&thread)
    }
}

impl<Driver> CallTable<Driver>
where
    Driver: GuestMemory + GuestTranslate,
{
    /// Restores every hijacked return slot to the real return point.
    ///
    /// Runs under guest pause during shutdown. Failures are logged and the
    /// remaining slots are still restored; returns `false` when any slot
    /// could not be restored.
    pub fn restore_all(&mut self, vmi: &GuestCore<Driver>, return_point: Va) -> bool {
        let mut ok = true;

        for (thread, _call) in self.calls.drain() {
            let slot = match vmi.translate_kernel_address(thread.0) {
                Ok(slot) => slot,
                Err(err) => {
                    tracing::error!(%err, %thread, "failed to translate a hijacked return slot");
                    ok = false;
                    continue;
                }
            };

            match vmi.write_u64(slot, return_point.0) {
                Ok(()) => tracing::debug!(%thread, "restored a hijacked return slot"),
                Err(err) => {
                    tracing::error!(%err, %thread, "failed to restore a hijacked return slot");
                    ok = false;
                }
            }
        }

        ok
    }
}
