use crate::{Gfn, MemoryAccess, Pa, Va, VcpuId, View, arch::Registers};

/// Event generated when monitored memory is accessed.
#[derive(Debug, Clone, Copy)]
pub struct EventMemoryAccess {
    /// Physical address that was accessed.
    pub pa: Pa,

    /// Virtual address that was accessed.
    pub va: Va,

    /// Type of access that occurred (read/write/execute).
    pub access: MemoryAccess,
}

/// Event generated when a VCPU executes the breakpoint instruction.
#[derive(Debug, Clone, Copy)]
pub struct EventInterrupt {
    /// GFN of the instruction that caused the interrupt.
    pub gfn: Gfn,

    /// Guest linear address of the instruction that caused the interrupt.
    pub gla: Va,
}

/// Event generated when a singlestep completes.
#[derive(Debug, Clone, Copy)]
pub struct EventSinglestep {
    /// GFN of the instruction that caused the singlestep.
    pub gfn: Gfn,
}

/// Reason for an event.
#[derive(Debug, Clone, Copy)]
pub enum EventReason {
    /// Memory access event (read/write).
    MemoryAccess(EventMemoryAccess),

    /// Breakpoint interrupt event.
    Interrupt(EventInterrupt),

    /// Singlestep completion event.
    Singlestep(EventSinglestep),
}

impl EventReason {
    /// Returns the memory access event.
    ///
    /// # Panics
    ///
    /// Panics if the event reason is not a memory access event.
    pub fn as_memory_access(&self) -> &EventMemoryAccess {
        match self {
            Self::MemoryAccess(memory_access) => memory_access,
            _ => panic!("EventReason is not a MemoryAccess"),
        }
    }

    /// Returns the interrupt event.
    ///
    /// # Panics
    ///
    /// Panics if the event reason is not an interrupt event.
    pub fn as_interrupt(&self) -> &EventInterrupt {
        match self {
            Self::Interrupt(interrupt) => interrupt,
            _ => panic!("EventReason is not an Interrupt"),
        }
    }

    /// Returns the singlestep event.
    ///
    /// # Panics
    ///
    /// Panics if the event reason is not a singlestep event.
    pub fn as_singlestep(&self) -> &EventSinglestep {
        match self {
            Self::Singlestep(singlestep) => singlestep,
            _ => panic!("EventReason is not a Singlestep"),
        }
    }
}

/// Specifies which hardware events should be monitored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventMonitor {
    /// Monitor breakpoint interrupts.
    Interrupt,

    /// Monitor singlestep completion on every VCPU.
    Singlestep,
}

/// An event delivered by the hypervisor.
#[derive(Debug, Clone, Copy)]
pub struct GuestEvent {
    /// The ID of the virtual CPU where the event occurred.
    vcpu_id: VcpuId,

    /// The view the VCPU was running in, if any.
    view: Option<View>,

    /// The CPU register state at the time of the event.
    registers: Registers,

    /// The reason for the event.
    reason: EventReason,
}

impl GuestEvent {
    /// Creates a new event.
    pub fn new(vcpu_id: VcpuId, view: Option<View>, registers: Registers, reason: EventReason) -> Self {
        Self {
            vcpu_id,
            view,
            registers,
            reason,
        }
    }

    /// Returns the ID of the virtual CPU where the event occurred.
    pub fn vcpu_id(&self) -> VcpuId {
        self.vcpu_id
    }

    /// Returns the view the VCPU was running in, if any.
    pub fn view(&self) -> Option<View> {
        self.view
    }

    /// Returns a reference to the CPU registers at the time of the event.
    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// Returns a reference to the reason for the event.
    pub fn reason(&self) -> &EventReason {
        &self.reason
    }
}

bitflags::bitflags! {
    /// Flags that can be set in an event response.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct EventResponseFlags: u8 {
        /// Reinject the interrupt into the guest.
        const REINJECT_INTERRUPT = 1 << 0;

        /// Toggle single-step mode on the originating VCPU.
        const TOGGLE_SINGLESTEP = 1 << 1;
    }
}

/// A response to an event.
///
/// The flags combine with the optional view assignment and register
/// overwrite; the driver applies all of them atomically to the originating
/// VCPU when the handler returns.
#[derive(Debug, Default)]
pub struct EventResponse {
    /// Flags associated with the response.
    pub flags: EventResponseFlags,

    /// The view to assign to the VCPU.
    pub view: Option<View>,

    /// The VCPU registers to set.
    pub registers: Option<Registers>,
}

impl EventResponse {
    /// Creates a response to reinject the interrupt.
    pub fn reinject_interrupt() -> Self {
        Self::default().and_reinject_interrupt()
    }

    /// Creates a response to toggle single-step mode.
    pub fn toggle_singlestep() -> Self {
        Self::default().and_toggle_singlestep()
    }

    /// Creates a response to assign a specific view.
    pub fn set_view(view: View) -> Self {
        Self::default().and_set_view(view)
    }

    /// Creates a response to set specific CPU registers.
    pub fn set_registers(registers: Registers) -> Self {
        Self::default().and_set_registers(registers)
    }

    /// Adds the reinject-interrupt flag to the response.
    pub fn and_reinject_interrupt(self) -> Self {
        Self {
            flags: self.flags | EventResponseFlags::REINJECT_INTERRUPT,
            ..self
        }
    }

    /// Adds the toggle single-step flag to the response.
    pub fn and_toggle_singlestep(self) -> Self {
        Self {
            flags: self.flags | EventResponseFlags::TOGGLE_SINGLESTEP,
            ..self
        }
    }

    /// Assigns a specific view to the response.
    pub fn and_set_view(self, view: View) -> Self {
        Self {
            view: Some(view),
            ..self
        }
    }

    /// Sets specific CPU registers for the response.
    pub fn and_set_registers(self, registers: Registers) -> Self {
        Self {
            registers: Some(registers),
            ..self
        }
    }
}
