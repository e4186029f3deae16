//! The tracing engine: lifecycle, registration and event dispatch.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use altrace_core::{
    EventInterrupt, EventMemoryAccess, EventMonitor, EventReason, EventResponse, FullGuestDriver,
    GuestCore, GuestDriver, GuestEvent, GuestOs, MemoryAccess, ProcessId, SyscallHandler,
    SyscallHook, ThreadId, TraceError, Va, VcpuId, View,
    arch::Registers,
};

use crate::{
    calls::{CallInFlight, CallTable},
    shadow::ShadowPages,
    trampoline,
};

/// How often the event wait returns so the termination flag is observed.
const EVENT_TIMEOUT: Duration = Duration::from_millis(500);

/// A system-call tracer for one guest.
///
/// The tracer emplaces breakpoints in shadow copies of kernel-code frames
/// and services the resulting events: a call-site hit invokes the attached
/// entry callback and hijacks the return slot on the guest stack; the
/// return-site hit invokes the exit callback and resumes the guest after
/// the original call site. The guest never observes a breakpoint in its own
/// memory.
///
/// Usage: construct with [`new`], register hooks with [`attach`] or
/// [`attach_all`], then [`run`] until the termination flag is raised.
///
/// [`new`]: Self::new
/// [`attach`]: Self::attach
/// [`attach_all`]: Self::attach_all
/// [`run`]: Self::run
pub struct Tracer<Driver, Os>
where
    Driver: FullGuestDriver,
    Os: GuestOs<Driver>,
{
    pub(crate) vmi: GuestCore<Driver>,
    os: Os,
    pub(crate) dispatcher: Dispatcher<Driver>,
    terminate: Arc<AtomicBool>,
    torn_down: bool,
}

impl<Driver, Os> Tracer<Driver, Os>
where
    Driver: FullGuestDriver,
    Os: GuestOs<Driver>,
{
    /// Creates a new tracer for the guest behind `vmi`.
    ///
    /// Under guest pause: snapshots the reservation size, enables alternate
    /// p2m views on the domain and creates the (not yet active) shadow
    /// view.
    pub fn new(vmi: GuestCore<Driver>, os: Os) -> Result<Self, TraceError> {
        let (info, view) = {
            let _pause = vmi.pause_guard()?;

            let info = vmi.info()?;
            vmi.set_alternate_views_enabled(true)?;
            let view = vmi.create_view(MemoryAccess::RWX)?;

            (info, view)
        };

        tracing::debug!(
            %view,
            memory = info.memory,
            vcpus = info.vcpus,
            os = ?info.os,
            "tracer initialized"
        );

        let default_view = vmi.default_view();

        Ok(Self {
            dispatcher: Dispatcher {
                view,
                default_view,
                address_width: info.address_width,
                trampoline: Va(0),
                return_point: Va(0),
                shadow: ShadowPages::new(view, info.memory),
                calls: CallTable::new(),
            },
            vmi,
            os,
            terminate: Arc::new(AtomicBool::new(false)),
            torn_down: false,
        })
    }

    /// Returns the engine's termination flag.
    ///
    /// The launcher registers terminating signals against this flag;
    /// [`run`] exits and tears down once it is raised.
    ///
    /// [`run`]: Self::run
    pub fn terminate_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminate)
    }

    /// Raises the termination flag.
    pub fn quit(&self) {
        self.terminate.store(true, Ordering::Relaxed);
    }

    /// Returns the shadow view the instrumented frames are mapped into.
    pub fn view(&self) -> View {
        self.dispatcher.view
    }

    /// Returns the number of pending call/return pairs.
    pub fn pending_calls(&self) -> usize {
        self.dispatcher.calls.len()
    }

    /// Returns the number of instrumented kernel-code frames.
    pub fn shadow_page_count(&self) -> usize {
        self.dispatcher.shadow.page_count()
    }

    /// Returns the reservation size the engine currently accounts for.
    pub fn current_memory(&self) -> u64 {
        self.dispatcher.shadow.current_memory()
    }

    /// Returns the discovered trampoline address, once [`run`] has started.
    ///
    /// [`run`]: Self::run
    pub fn trampoline(&self) -> Va {
        self.dispatcher.trampoline
    }

    /// Returns the discovered return point, once [`run`] has started.
    ///
    /// [`run`]: Self::run
    pub fn return_point(&self) -> Va {
        self.dispatcher.return_point
    }

    /// Attaches callbacks to a named kernel symbol.
    ///
    /// Pauses the guest, resolves the symbol and emplaces the breakpoint in
    /// the symbol's shadow frame. Unresolvable and untranslatable symbols
    /// are logged and skipped (`Ok(false)`); a second attach to the same
    /// address keeps the first callbacks and reports success.
    pub fn attach(
        &mut self,
        symbol: &str,
        handler: Arc<dyn SyscallHandler<Driver>>,
    ) -> Result<bool, TraceError> {
        let _pause = self.vmi.pause_guard()?;

        let va = match self.vmi.resolve_kernel_symbol(symbol) {
            Ok(va) => va,
            Err(err) => {
                tracing::warn!(symbol, %err, "skipping an unresolvable symbol");
                return Ok(false);
            }
        };

        let pa = match self.vmi.translate_kernel_address(va) {
            Ok(pa) => pa,
            Err(err) => {
                tracing::warn!(symbol, %va, %err, "skipping an untranslatable symbol");
                return Ok(false);
            }
        };

        match self.dispatcher.shadow.install(&self.vmi, pa, handler)? {
            true => tracing::debug!(symbol, %va, %pa, "attached"),
            false => tracing::debug!(symbol, %va, "already attached"),
        }

        Ok(true)
    }

    /// Attaches a list of hooks, returning the number attached.
    ///
    /// Per-hook failures are logged; the remaining hooks are still
    /// processed.
    pub fn attach_all(&mut self, hooks: impl IntoIterator<Item = SyscallHook<Driver>>) -> usize {
        let mut attached = 0;

        for hook in hooks {
            match self.attach(&hook.symbol, hook.handler) {
                Ok(true) => attached += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(symbol = hook.symbol, %err, "failed to attach");
                }
            }
        }

        attached
    }

    /// Runs the event loop until the termination flag is raised.
    ///
    /// Activates the shadow view, resolves the return point and the
    /// trampoline, then services events. On exit — including on a fatal
    /// event-loop error — the guest is restored by [`teardown`].
    ///
    /// [`teardown`]: Self::teardown
    pub fn run(&mut self) -> Result<(), TraceError> {
        self.start()?;

        while !self.terminate.load(Ordering::Relaxed) {
            let result = {
                let vmi = &self.vmi;
                let dispatcher = &mut self.dispatcher;

                vmi.wait_for_event(EVENT_TIMEOUT, |event| dispatcher.handle_event(vmi, event))
            };

            match result {
                Ok(()) => {}
                Err(TraceError::Timeout) => tracing::trace!("timeout"),
                Err(err) => {
                    tracing::error!(%err, "event loop failed");
                    let _ = self.teardown();
                    return Err(err);
                }
            }
        }

        self.teardown()
    }

    /// Switches the guest into the shadow view and arms event delivery.
    pub(crate) fn start(&mut self) -> Result<(), TraceError> {
        let _pause = self.vmi.pause_guard()?;

        self.vmi.switch_to_view(self.dispatcher.view)?;
        self.vmi.monitor_enable(EventMonitor::Interrupt)?;
        self.vmi.monitor_enable(EventMonitor::Singlestep)?;

        let registers = self.vmi.registers(VcpuId(0))?;
        self.dispatcher.return_point = self.os.find_return_point(&self.vmi, &registers)?;
        self.dispatcher.trampoline = trampoline::locate(&self.vmi, &registers)?;

        tracing::info!(
            return_point = %self.dispatcher.return_point,
            trampoline = %self.dispatcher.trampoline,
            "tracing started"
        );

        Ok(())
    }

    /// Restores the guest and releases every hypervisor-side resource.
    ///
    /// Under guest pause: restores hijacked return slots, restores the
    /// original bytes and drops every shadow frame, deactivates and
    /// destroys the shadow view, disables alternate views and restores the
    /// initial reservation. Each step is attempted even when an earlier one
    /// fails; [`TraceError::Teardown`] reports that some step was skipped.
    pub fn teardown(&mut self) -> Result<(), TraceError> {
        if self.torn_down {
            return Ok(());
        }

        self.torn_down = true;
        self.terminate.store(true, Ordering::Relaxed);

        let mut ok = true;

        let pause = self.vmi.pause_guard();
        if let Err(err) = &pause {
            tracing::error!(%err, "failed to pause the guest for teardown");
            ok = false;
        }

        ok &= self
            .dispatcher
            .calls
            .restore_all(&self.vmi, self.dispatcher.return_point);
        ok &= self.dispatcher.shadow.clear(&self.vmi);

        for monitor in [EventMonitor::Interrupt, EventMonitor::Singlestep] {
            if let Err(err) = self.vmi.monitor_disable(monitor) {
                tracing::error!(%err, ?monitor, "failed to disable a monitor");
                ok = false;
            }
        }

        if let Err(err) = self.vmi.switch_to_view(self.dispatcher.default_view) {
            tracing::error!(%err, "failed to switch back to the default view");
            ok = false;
        }

        if let Err(err) = self.vmi.destroy_view(self.dispatcher.view) {
            tracing::error!(%err, "failed to destroy the shadow view");
            ok = false;
        }

        if let Err(err) = self.vmi.set_alternate_views_enabled(false) {
            tracing::error!(%err, "failed to disable alternate views");
            ok = false;
        }

        if let Err(err) = self.vmi.set_max_memory(self.dispatcher.shadow.init_memory()) {
            tracing::error!(%err, "failed to restore the initial reservation");
            ok = false;
        }

        drop(pause);

        tracing::info!(ok, "teardown finished");

        match ok {
            true => Ok(()),
            false => Err(TraceError::Teardown),
        }
    }
}

impl<Driver, Os> Drop for Tracer<Driver, Os>
where
    Driver: FullGuestDriver,
    Os: GuestOs<Driver>,
{
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            tracing::error!(%err, "teardown on drop reported warnings");
        }
    }
}

/// The event dispatcher: the per-VCPU state machine around every
/// instrumented transition.
///
/// All three event classes are delivered serialized on one thread, so the
/// dispatcher's state needs no locking.
pub(crate) struct Dispatcher<Driver>
where
    Driver: GuestDriver,
{
    /// The shadow view holding the instrumented frames.
    view: View,

    /// The unmodified view used for single-step windows.
    default_view: View,

    /// The guest pointer width in bytes.
    address_width: u64,

    /// The pre-existing breakpoint byte hijacked returns jump to.
    ///
    /// Resolved once before the first event is delivered.
    trampoline: Va,

    /// The instruction after the dispatch call in the syscall entry.
    ///
    /// Resolved once before the first event is delivered.
    return_point: Va,

    pub(crate) shadow: ShadowPages<Driver>,
    pub(crate) calls: CallTable<Driver>,
}

impl<Driver> Dispatcher<Driver>
where
    Driver: FullGuestDriver,
{
    /// Services one event and produces the response applied to the
    /// originating VCPU.
    pub(crate) fn handle_event(
        &mut self,
        vmi: &GuestCore<Driver>,
        event: &GuestEvent,
    ) -> EventResponse {
        // The guest may have remapped its page tables since the last event.
        vmi.flush_translation_cache();

        match event.reason() {
            EventReason::Interrupt(interrupt) => self.on_interrupt(vmi, event, interrupt),
            EventReason::MemoryAccess(access) => self.on_memory_access(event, access),
            EventReason::Singlestep(_) => self.on_singlestep(event),
        }
    }

    /// A VCPU executed a breakpoint opcode.
    fn on_interrupt(
        &mut self,
        vmi: &GuestCore<Driver>,
        event: &GuestEvent,
        interrupt: &EventInterrupt,
    ) -> EventResponse {
        if interrupt.gla == self.trampoline {
            self.on_return_site(vmi, event)
        }
        else {
            self.on_call_site(vmi, event, interrupt.gla)
        }
    }

    /// Call-site branch: the guest entered a traced kernel function.
    fn on_call_site(
        &mut self,
        vmi: &GuestCore<Driver>,
        event: &GuestEvent,
        gla: Va,
    ) -> EventResponse {
        let registers = event.registers();

        let pa = match vmi.translate_kernel_address(gla) {
            Ok(pa) => pa,
            Err(err) => {
                tracing::warn!(%gla, %err, "interrupt at an untranslatable address, reinjecting");
                return EventResponse::reinject_interrupt();
            }
        };

        let handler = match self.shadow.lookup(pa) {
            Some(record) => Arc::clone(&record.handler),
            None => {
                // Genuinely the guest's own interrupt.
                tracing::warn!(%gla, %pa, "unknown breakpoint, reinjecting");
                return EventResponse::reinject_interrupt();
            }
        };

        // Whatever happens below, the VCPU must execute the original
        // instruction through the default view and come back via the
        // single-step handler.
        let response =
            EventResponse::toggle_singlestep().and_set_view(self.default_view);

        let thread = ThreadId(registers.stack_pointer());

        let slot = match vmi.translate_kernel_address(thread.0) {
            Ok(slot) => slot,
            Err(err) => {
                tracing::warn!(%thread, %err, "stack slot not translatable, not hijacking");
                return response;
            }
        };

        let return_address = match vmi.read_u64(slot) {
            Ok(value) => Va(value),
            Err(err) => {
                tracing::warn!(%thread, %err, "stack slot not readable, not hijacking");
                return response;
            }
        };

        if return_address != self.return_point {
            // Reached through an unexpected caller; a hijack here would
            // divert a return path we do not service.
            tracing::debug!(%gla, %thread, %return_address, "unexpected return address");
            return response;
        }

        let pid = self.current_pid(vmi, registers);
        let user_state = handler.enter(vmi, event, pid, thread);

        self.calls.insert(
            thread,
            CallInFlight {
                handler,
                user_state,
            },
        );

        if let Err(err) = vmi.write_u64(slot, self.trampoline.0) {
            tracing::warn!(%thread, %err, "failed to hijack the return slot");
            self.calls.remove(thread);
            return response;
        }

        tracing::trace!(%gla, %pid, %thread, "call hijacked");
        response
    }

    /// Return-site branch: a hijacked call returned into the trampoline.
    fn on_return_site(&mut self, vmi: &GuestCore<Driver>, event: &GuestEvent) -> EventResponse {
        let registers = event.registers();

        // The return has already consumed the slot, so the key is the stack
        // pointer before the pop.
        let thread = ThreadId(registers.stack_pointer() - self.address_width);

        let call = match self.calls.remove(thread) {
            Some(call) => call,
            None => {
                tracing::debug!(%thread, "return-site hit without a pending call");
                return EventResponse::default();
            }
        };

        let pid = self.current_pid(vmi, registers);
        call.handler.exit(vmi, event, pid, thread, call.user_state);

        tracing::trace!(%pid, %thread, "call completed");

        // Resume after the original call site.
        let mut registers = *registers;
        registers.set_instruction_pointer(self.return_point);
        EventResponse::set_registers(registers)
    }

    /// The guest read or wrote a monitored page.
    ///
    /// The access is replayed against the clean bytes through the default
    /// view; no callback is involved.
    fn on_memory_access(
        &mut self,
        event: &GuestEvent,
        access: &EventMemoryAccess,
    ) -> EventResponse {
        tracing::trace!(
            vcpu = %event.vcpu_id(),
            pa = %access.pa,
            va = %access.va,
            access = %access.access,
            "monitored page touched"
        );

        EventResponse::toggle_singlestep().and_set_view(self.default_view)
    }

    /// A single-step window closed; re-arm the shadow view.
    fn on_singlestep(&mut self, event: &GuestEvent) -> EventResponse {
        tracing::trace!(vcpu = %event.vcpu_id(), "single step completed");

        EventResponse::toggle_singlestep().and_set_view(self.view)
    }

    /// Resolves the process behind the current translation root.
    fn current_pid(&self, vmi: &GuestCore<Driver>, registers: &Registers) -> ProcessId {
        match vmi.process_id_from_root(registers.translation_root()) {
            Ok(pid) => pid,
            Err(err) => {
                tracing::warn!(%err, "failed to resolve the process id");
                ProcessId(0)
            }
        }
    }
}
