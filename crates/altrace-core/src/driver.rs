//! Guest driver trait hierarchy.
//!
//! The hypervisor control channel and the VMI library are external
//! collaborators; this module defines the capabilities the engine needs from
//! them. Each trait represents an independent capability; drivers implement
//! only the traits they support.
//!
//! ```text
//! GuestDriver (base: guest metadata)
//! ├── GuestMemory       read/write guest physical pages
//! ├── GuestTranslate    kernel address and symbol translation
//! ├── GuestRegisters    get vCPU register state
//! ├── GuestViews        manage alternate p2m views and page permissions
//! ├── GuestPhysmap      physical-frame reservation control
//! ├── GuestEvents       monitor and deliver events
//! └── GuestVmControl    pause and resume the guest
//! ```
//!
//! A hypervisor-backed driver that implements everything automatically
//! satisfies [`FullGuestDriver`].

use std::time::Duration;

use crate::{
    EventMonitor, EventResponse, Gfn, GuestEvent, GuestInfo, MemoryAccess, Pa, ProcessId,
    TraceError, Va, VcpuId, View, arch::Registers,
};

/// Base trait for all guest driver sub-traits.
///
/// The `'static` lifetime is required so callback handlers can be stored as
/// trait objects parameterized by the driver.
pub trait GuestDriver: 'static {
    /// Returns information about the guest.
    fn info(&self) -> Result<GuestInfo, TraceError>;
}

/// Capability to read and write guest physical memory pages.
pub trait GuestMemory: GuestDriver {
    /// Reads a page of memory from the guest.
    fn read_page(&self, gfn: Gfn) -> Result<Vec<u8>, TraceError>;

    /// Writes data into a page of guest memory.
    fn write_page(&self, gfn: Gfn, offset: u64, content: &[u8]) -> Result<(), TraceError>;
}

/// Capability to translate kernel addresses and symbols.
pub trait GuestTranslate: GuestDriver {
    /// Translates a kernel virtual address to a guest physical address.
    fn translate_kernel_address(&self, va: Va) -> Result<Pa, TraceError>;

    /// Resolves a kernel symbol to its virtual address.
    fn resolve_kernel_symbol(&self, name: &str) -> Result<Va, TraceError>;

    /// Maps a page-table root to the process identifier that owns it.
    fn process_id_from_root(&self, root: Pa) -> Result<ProcessId, TraceError>;
}

/// Capability to read vCPU registers.
pub trait GuestRegisters: GuestDriver {
    /// Returns the registers of a specific virtual CPU.
    fn registers(&self, vcpu: VcpuId) -> Result<Registers, TraceError>;
}

/// Capability to manage alternate p2m views.
pub trait GuestViews: GuestDriver {
    /// Enables or disables alternate p2m views on the domain.
    fn set_alternate_views_enabled(&self, enabled: bool) -> Result<(), TraceError>;

    /// Returns the default view of the guest.
    fn default_view(&self) -> View;

    /// Creates a new view with the specified default access permissions.
    fn create_view(&self, default_access: MemoryAccess) -> Result<View, TraceError>;

    /// Destroys a previously created view.
    fn destroy_view(&self, view: View) -> Result<(), TraceError>;

    /// Switches every VCPU to a different view.
    fn switch_to_view(&self, view: View) -> Result<(), TraceError>;

    /// Changes the mapping of a GFN in a specific view.
    fn change_view_gfn(&self, view: View, old_gfn: Gfn, new_gfn: Gfn) -> Result<(), TraceError>;

    /// Resets the mapping of a GFN in a specific view to its original state.
    fn reset_view_gfn(&self, view: View, gfn: Gfn) -> Result<(), TraceError>;

    /// Sets the memory access permissions for a GFN in a specific view.
    fn set_memory_access(&self, gfn: Gfn, view: View, access: MemoryAccess)
    -> Result<(), TraceError>;
}

/// Capability to control the guest's physical-frame reservation.
pub trait GuestPhysmap: GuestDriver {
    /// Sets the maximum physical-memory reservation of the domain in bytes.
    fn set_max_memory(&self, bytes: u64) -> Result<(), TraceError>;

    /// Allocates and populates a specific guest frame.
    ///
    /// The populated frame is zero-filled.
    fn allocate_frame(&self, gfn: Gfn) -> Result<(), TraceError>;

    /// Frees a previously allocated guest frame.
    fn free_frame(&self, gfn: Gfn) -> Result<(), TraceError>;
}

/// Capability to control event monitoring and delivery.
pub trait GuestEvents: GuestDriver {
    /// Enables monitoring of an event class.
    fn monitor_enable(&self, monitor: EventMonitor) -> Result<(), TraceError>;

    /// Disables monitoring of an event class.
    fn monitor_disable(&self, monitor: EventMonitor) -> Result<(), TraceError>;

    /// Waits for an event to occur and processes it with the provided
    /// handler.
    ///
    /// Returns [`TraceError::Timeout`] when no event arrived within the
    /// timeout. Event delivery is serialized; the handler is never invoked
    /// concurrently.
    fn wait_for_event(
        &self,
        timeout: Duration,
        handler: impl FnMut(&GuestEvent) -> EventResponse,
    ) -> Result<(), TraceError>;
}

/// Capability to pause and resume the guest.
pub trait GuestVmControl: GuestDriver {
    /// Pauses the guest.
    fn pause(&self) -> Result<(), TraceError>;

    /// Resumes the guest.
    fn resume(&self) -> Result<(), TraceError>;
}

/// A driver providing every capability the tracing engine needs.
///
/// This is a convenience supertrait; types implementing all sub-traits
/// automatically implement it via a blanket implementation.
pub trait FullGuestDriver:
    GuestMemory
    + GuestTranslate
    + GuestRegisters
    + GuestViews
    + GuestPhysmap
    + GuestEvents
    + GuestVmControl
{
}

impl<T> FullGuestDriver for T where
    T: GuestMemory
        + GuestTranslate
        + GuestRegisters
        + GuestViews
        + GuestPhysmap
        + GuestEvents
        + GuestVmControl
{
}
