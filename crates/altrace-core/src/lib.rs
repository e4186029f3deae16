//! Core guest abstraction for alt-p2m system-call tracing.
//!
//! This crate defines the address and permission types, the AMD64 register
//! image, the [`GuestDriver`] capability-trait hierarchy behind which the
//! hypervisor control channel and the VMI library live, the event types the
//! drivers deliver, and [`GuestCore`] — the wrapper the tracing engine works
//! against.

pub mod arch;
mod core;
mod driver;
mod error;
mod event;
mod os;

use std::{cell::RefCell, num::NonZeroUsize, time::Duration};

use lru::LruCache;

pub use self::{
    core::{Gfn, GuestInfo, Hex, MemoryAccess, OsKind, Pa, Va, VcpuId, View},
    driver::{
        FullGuestDriver, GuestDriver, GuestEvents, GuestMemory, GuestPhysmap, GuestRegisters,
        GuestTranslate, GuestViews, GuestVmControl,
    },
    error::{PageFaults, TraceError},
    event::{
        EventInterrupt, EventMemoryAccess, EventMonitor, EventReason, EventResponse,
        EventResponseFlags, EventSinglestep, GuestEvent,
    },
    os::{GuestOs, ProcessId, SyscallHandler, SyscallHook, ThreadId, UserState},
};
use self::arch::Registers;

/// The core functionality for introspecting one guest.
///
/// Wraps a driver with a kernel virtual-to-physical translation cache and
/// byte-level access helpers. The cache must be flushed at every event
/// delivery, before any translation is consulted, because the guest may have
/// changed its page tables in between.
pub struct GuestCore<Driver>
where
    Driver: GuestDriver,
{
    driver: Driver,
    v2p: RefCell<LruCache<Va, Pa>>,
}

impl<Driver> GuestCore<Driver>
where
    Driver: GuestDriver,
{
    const DEFAULT_CACHE_SIZE: usize = 8192;

    /// Creates a new `GuestCore` instance with the given driver.
    pub fn new(driver: Driver) -> Self {
        Self {
            driver,
            v2p: RefCell::new(LruCache::new(
                NonZeroUsize::new(Self::DEFAULT_CACHE_SIZE).unwrap(),
            )),
        }
    }

    /// Returns the driver used by this instance.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Retrieves information about the guest.
    pub fn info(&self) -> Result<GuestInfo, TraceError> {
        self.driver.info()
    }

    /// Clears the translation cache.
    ///
    /// The guest can modify its page tables between events; stale
    /// translations would make the engine read or write the wrong frames.
    pub fn flush_translation_cache(&self) {
        self.v2p.borrow_mut().clear();
    }
}

///////////////////////////////////////////////////////////////////////////////
// GuestVmControl
///////////////////////////////////////////////////////////////////////////////

impl<Driver> GuestCore<Driver>
where
    Driver: GuestVmControl,
{
    /// Pauses the guest.
    pub fn pause(&self) -> Result<(), TraceError> {
        self.driver.pause()
    }

    /// Resumes the guest.
    pub fn resume(&self) -> Result<(), TraceError> {
        self.driver.resume()
    }

    /// Pauses the guest and returns a guard that resumes it when dropped.
    pub fn pause_guard(&self) -> Result<PauseGuard<'_, Driver>, TraceError> {
        PauseGuard::new(&self.driver)
    }
}

///////////////////////////////////////////////////////////////////////////////
// GuestRegisters
///////////////////////////////////////////////////////////////////////////////

impl<Driver> GuestCore<Driver>
where
    Driver: GuestRegisters,
{
    /// Retrieves the current register state of a virtual CPU.
    pub fn registers(&self, vcpu: VcpuId) -> Result<Registers, TraceError> {
        self.driver.registers(vcpu)
    }
}

///////////////////////////////////////////////////////////////////////////////
// GuestMemory
///////////////////////////////////////////////////////////////////////////////

impl<Driver> GuestCore<Driver>
where
    Driver: GuestMemory,
{
    /// Reads a page of memory from the guest.
    pub fn read_page(&self, gfn: Gfn) -> Result<Vec<u8>, TraceError> {
        self.driver.read_page(gfn)
    }

    /// Writes data into a page of guest memory.
    pub fn write_page(&self, gfn: Gfn, offset: u64, content: &[u8]) -> Result<(), TraceError> {
        self.driver.write_page(gfn, offset, content)
    }

    /// Reads memory at a guest physical address.
    pub fn read(&self, pa: Pa, buffer: &mut [u8]) -> Result<(), TraceError> {
        let mut position = 0usize;

        while position < buffer.len() {
            let address = pa + position as u64;
            let gfn = arch::gfn_from_pa(address);
            let offset = arch::pa_offset(address) as usize;

            let page = self.read_page(gfn)?;
            let page = &page[offset..];

            let size = std::cmp::min(buffer.len() - position, page.len());
            buffer[position..position + size].copy_from_slice(&page[..size]);

            position += size;
        }

        Ok(())
    }

    /// Writes memory at a guest physical address.
    pub fn write(&self, pa: Pa, buffer: &[u8]) -> Result<(), TraceError> {
        let mut position = 0usize;

        while position < buffer.len() {
            let address = pa + position as u64;
            let gfn = arch::gfn_from_pa(address);
            let offset = arch::pa_offset(address);

            let size = std::cmp::min(
                buffer.len() - position,
                (arch::PAGE_SIZE - offset) as usize,
            );

            self.write_page(gfn, offset, &buffer[position..position + size])?;

            position += size;
        }

        Ok(())
    }

    /// Reads a single byte from the guest.
    pub fn read_u8(&self, pa: Pa) -> Result<u8, TraceError> {
        let mut buffer = [0u8; 1];
        self.read(pa, &mut buffer)?;
        Ok(buffer[0])
    }

    /// Reads a 64-bit unsigned integer from the guest.
    pub fn read_u64(&self, pa: Pa) -> Result<u64, TraceError> {
        let mut buffer = [0u8; 8];
        self.read(pa, &mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }

    /// Writes a single byte to the guest.
    pub fn write_u8(&self, pa: Pa, value: u8) -> Result<(), TraceError> {
        self.write(pa, &value.to_le_bytes())
    }

    /// Writes a 64-bit unsigned integer to the guest.
    pub fn write_u64(&self, pa: Pa, value: u64) -> Result<(), TraceError> {
        self.write(pa, &value.to_le_bytes())
    }
}

///////////////////////////////////////////////////////////////////////////////
// GuestTranslate
///////////////////////////////////////////////////////////////////////////////

impl<Driver> GuestCore<Driver>
where
    Driver: GuestTranslate,
{
    /// Translates a kernel virtual address to a guest physical address.
    ///
    /// Translations are cached per page until [`flush_translation_cache`]
    /// is called.
    ///
    /// [`flush_translation_cache`]: Self::flush_translation_cache
    pub fn translate_kernel_address(&self, va: Va) -> Result<Pa, TraceError> {
        let page = va & arch::PAGE_MASK;

        let mut cache = self.v2p.borrow_mut();
        if let Some(base) = cache.get(&page) {
            return Ok(*base + arch::va_offset(va));
        }

        let base = self.driver.translate_kernel_address(page)?;
        cache.put(page, base);

        Ok(base + arch::va_offset(va))
    }

    /// Resolves a kernel symbol to its virtual address.
    pub fn resolve_kernel_symbol(&self, name: &str) -> Result<Va, TraceError> {
        self.driver.resolve_kernel_symbol(name)
    }

    /// Maps a page-table root to the process identifier that owns it.
    pub fn process_id_from_root(&self, root: Pa) -> Result<ProcessId, TraceError> {
        self.driver.process_id_from_root(root)
    }
}

impl<Driver> GuestCore<Driver>
where
    Driver: GuestMemory + GuestTranslate,
{
    /// Reads memory at a kernel virtual address, translating page by page.
    pub fn read_kernel(&self, va: Va, buffer: &mut [u8]) -> Result<(), TraceError> {
        let mut position = 0usize;

        while position < buffer.len() {
            let address = self.translate_kernel_address(va + position as u64)?;
            let offset = arch::pa_offset(address);

            let size = std::cmp::min(
                buffer.len() - position,
                (arch::PAGE_SIZE - offset) as usize,
            );

            self.read(address, &mut buffer[position..position + size])?;

            position += size;
        }

        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////////////
// GuestViews
///////////////////////////////////////////////////////////////////////////////

impl<Driver> GuestCore<Driver>
where
    Driver: GuestViews,
{
    /// Enables or disables alternate p2m views on the domain.
    pub fn set_alternate_views_enabled(&self, enabled: bool) -> Result<(), TraceError> {
        self.driver.set_alternate_views_enabled(enabled)
    }

    /// Returns the default view of the guest.
    pub fn default_view(&self) -> View {
        self.driver.default_view()
    }

    /// Creates a new view with the specified default access permissions.
    pub fn create_view(&self, default_access: MemoryAccess) -> Result<View, TraceError> {
        self.driver.create_view(default_access)
    }

    /// Destroys a previously created view.
    pub fn destroy_view(&self, view: View) -> Result<(), TraceError> {
        self.driver.destroy_view(view)
    }

    /// Switches every VCPU to a different view.
    pub fn switch_to_view(&self, view: View) -> Result<(), TraceError> {
        self.driver.switch_to_view(view)
    }

    /// Changes the mapping of a GFN in a specific view.
    pub fn change_view_gfn(&self, view: View, old_gfn: Gfn, new_gfn: Gfn) -> Result<(), TraceError> {
        self.driver.change_view_gfn(view, old_gfn, new_gfn)
    }

    /// Resets the mapping of a GFN in a specific view to its original state.
    pub fn reset_view_gfn(&self, view: View, gfn: Gfn) -> Result<(), TraceError> {
        self.driver.reset_view_gfn(view, gfn)
    }

    /// Sets the memory access permissions for a GFN in a specific view.
    pub fn set_memory_access(
        &self,
        gfn: Gfn,
        view: View,
        access: MemoryAccess,
    ) -> Result<(), TraceError> {
        self.driver.set_memory_access(gfn, view, access)
    }
}

///////////////////////////////////////////////////////////////////////////////
// GuestPhysmap
///////////////////////////////////////////////////////////////////////////////

impl<Driver> GuestCore<Driver>
where
    Driver: GuestPhysmap,
{
    /// Sets the maximum physical-memory reservation of the domain in bytes.
    pub fn set_max_memory(&self, bytes: u64) -> Result<(), TraceError> {
        self.driver.set_max_memory(bytes)
    }

    /// Allocates the next available guest frame.
    ///
    /// Finds and populates the first free frame past the current maximum.
    /// The populated frame is zero-filled.
    pub fn allocate_next_available_frame(&self) -> Result<Gfn, TraceError> {
        let info = self.info()?;

        let next_available_gfn = info.max_gfn + 1;
        self.driver.allocate_frame(next_available_gfn)?;
        Ok(next_available_gfn)
    }

    /// Frees a previously allocated guest frame.
    pub fn free_frame(&self, gfn: Gfn) -> Result<(), TraceError> {
        self.driver.free_frame(gfn)
    }
}

///////////////////////////////////////////////////////////////////////////////
// GuestEvents
///////////////////////////////////////////////////////////////////////////////

impl<Driver> GuestCore<Driver>
where
    Driver: GuestEvents,
{
    /// Enables monitoring of an event class.
    pub fn monitor_enable(&self, monitor: EventMonitor) -> Result<(), TraceError> {
        self.driver.monitor_enable(monitor)
    }

    /// Disables monitoring of an event class.
    pub fn monitor_disable(&self, monitor: EventMonitor) -> Result<(), TraceError> {
        self.driver.monitor_disable(monitor)
    }

    /// Waits for an event to occur and processes it with the provided
    /// handler.
    pub fn wait_for_event(
        &self,
        timeout: Duration,
        handler: impl FnMut(&GuestEvent) -> EventResponse,
    ) -> Result<(), TraceError> {
        self.driver.wait_for_event(timeout, handler)
    }
}

/// A guard that pauses the guest on creation and resumes it on drop.
pub struct PauseGuard<'a, Driver>
where
    Driver: GuestVmControl,
{
    driver: &'a Driver,
}

impl<'a, Driver> PauseGuard<'a, Driver>
where
    Driver: GuestVmControl,
{
    /// Creates a new pause guard.
    pub fn new(driver: &'a Driver) -> Result<Self, TraceError> {
        driver.pause()?;
        Ok(Self { driver })
    }
}

impl<Driver> Drop for PauseGuard<'_, Driver>
where
    Driver: GuestVmControl,
{
    fn drop(&mut self) {
        if let Err(err) = self.driver.resume() {
            tracing::error!(?err, "Failed to resume the guest");
        }
    }
}
