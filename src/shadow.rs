//! Shadow frames and the breakpoint registry.
//!
//! Every instrumented kernel-code frame is backed by a freshly allocated
//! shadow frame: a byte-exact copy of the original page with breakpoint
//! opcodes emplaced. The shadow view maps the original frame number to the
//! shadow frame, so only VCPUs running in that view observe the breakpoints.
//! Guest reads and writes of the original frame trap in the shadow view, so
//! kernel integrity checks are answered from the clean bytes.

use std::{collections::HashMap, sync::Arc};

use altrace_core::{
    Gfn, GuestCore, GuestDriver, GuestMemory, GuestPhysmap, GuestViews, MemoryAccess, Pa,
    SyscallHandler, TraceError, View, arch,
};
use indexmap::IndexMap;

/// A single breakpoint within a shadow page.
pub(crate) struct BreakpointRecord<Driver>
where
    Driver: GuestDriver,
{
    /// Offset of the breakpoint within the page.
    #[expect(unused)]
    pub offset: u16,

    /// Callbacks attached to the traced kernel function.
    pub handler: Arc<dyn SyscallHandler<Driver>>,
}

/// One instrumented kernel-code frame.
pub(crate) struct PageRecord<Driver>
where
    Driver: GuestDriver,
{
    /// The original frame the guest believes it is running.
    pub original_gfn: Gfn,

    /// The allocated frame holding the instrumented copy.
    pub shadow_gfn: Gfn,

    /// Breakpoints within the page, keyed by offset.
    pub children: IndexMap<u16, BreakpointRecord<Driver>>,
}

/// The shadow table: original frame ↔ shadow frame, plus the per-page
/// breakpoint records and the reservation accounting.
///
/// The maximum reservation always equals the initial reservation plus one
/// page per live record.
pub(crate) struct ShadowPages<Driver>
where
    Driver: GuestDriver,
{
    /// The shadow view the instrumented frames are mapped into.
    view: View,

    /// Original frame → shadow frame.
    mappings: HashMap<Gfn, Gfn>,

    /// Shadow frame → page record.
    records: IndexMap<Gfn, PageRecord<Driver>>,

    /// The reservation size snapshotted before the first allocation.
    init_memory: u64,

    /// The reservation size the engine currently accounts for.
    current_memory: u64,
}

impl<Driver> ShadowPages<Driver>
where
    Driver: GuestMemory + GuestViews + GuestPhysmap,
{
    /// Creates an empty shadow table.
    pub fn new(view: View, init_memory: u64) -> Self {
        Self {
            view,
            mappings: HashMap::new(),
            records: IndexMap::new(),
            init_memory,
            current_memory: init_memory,
        }
    }

    /// Returns the reservation size snapshotted at creation.
    pub fn init_memory(&self) -> u64 {
        self.init_memory
    }

    /// Returns the reservation size the engine currently accounts for.
    pub fn current_memory(&self) -> u64 {
        self.current_memory
    }

    /// Returns the number of instrumented frames.
    pub fn page_count(&self) -> usize {
        self.records.len()
    }

    /// Looks up the breakpoint record covering a guest physical address.
    pub fn lookup(&self, pa: Pa) -> Option<&BreakpointRecord<Driver>> {
        let shadow_gfn = self.mappings.get(&arch::gfn_from_pa(pa))?;
        let record = self.records.get(shadow_gfn)?;
        record.children.get(&(arch::pa_offset(pa) as u16))
    }

    /// Emplaces a breakpoint at a guest physical address.
    ///
    /// The opcode is written only to the shadow frame; the original byte
    /// stays untouched. Returns `false` when the offset already carries a
    /// breakpoint — the existing record and its callbacks are kept.
    pub fn install(
        &mut self,
        vmi: &GuestCore<Driver>,
        pa: Pa,
        handler: Arc<dyn SyscallHandler<Driver>>,
    ) -> Result<bool, TraceError> {
        let original_gfn = arch::gfn_from_pa(pa);
        let offset = arch::pa_offset(pa) as u16;

        let shadow_gfn = self.ensure_page(vmi, original_gfn)?;

        let record = self
            .records
            .get_mut(&shadow_gfn)
            .ok_or(TraceError::Other("shadow table desynchronized"))?;

        if record.children.contains_key(&offset) {
            tracing::debug!(%pa, "breakpoint already present");
            return Ok(false);
        }

        vmi.write_u8(
            arch::pa_from_gfn(shadow_gfn) + offset as u64,
            arch::BREAKPOINT,
        )?;
        record.children.insert(offset, BreakpointRecord { offset, handler });

        tracing::debug!(
            %pa,
            %shadow_gfn,
            breakpoints = record.children.len(),
            "breakpoint emplaced"
        );

        Ok(true)
    }

    /// Returns the page record for an original frame, instrumenting the
    /// frame on first use.
    ///
    /// Creation is transactional: the shadow frame is allocated, the page
    /// copied, the shadow view remapped and the original frame watched
    /// before the record is inserted; any failure unwinds the allocation
    /// and the reservation raise.
    fn ensure_page(
        &mut self,
        vmi: &GuestCore<Driver>,
        original_gfn: Gfn,
    ) -> Result<Gfn, TraceError> {
        if let Some(&shadow_gfn) = self.mappings.get(&original_gfn) {
            return Ok(shadow_gfn);
        }

        let shadow_gfn = self.allocate_shadow_frame(vmi)?;

        if let Err(err) = self.populate_page(vmi, original_gfn, shadow_gfn) {
            // Unwind so the accounted reservation reflects reality.
            if let Err(err) = vmi.reset_view_gfn(self.view, original_gfn) {
                tracing::error!(%err, %original_gfn, "failed to unwind the shadow mapping");
            }
            self.free_shadow_frame(vmi, shadow_gfn);
            return Err(err);
        }

        self.mappings.insert(original_gfn, shadow_gfn);
        self.records.insert(
            shadow_gfn,
            PageRecord {
                original_gfn,
                shadow_gfn,
                children: IndexMap::new(),
            },
        );

        tracing::debug!(
            %original_gfn,
            %shadow_gfn,
            pages = self.records.len(),
            "shadow frame installed"
        );

        Ok(shadow_gfn)
    }

    /// Copies the original page into the shadow frame, remaps the shadow
    /// view and arms the read/write watch on the original frame.
    fn populate_page(
        &self,
        vmi: &GuestCore<Driver>,
        original_gfn: Gfn,
        shadow_gfn: Gfn,
    ) -> Result<(), TraceError> {
        let content = vmi.read_page(original_gfn)?;
        vmi.write_page(shadow_gfn, 0, &content)?;

        vmi.change_view_gfn(self.view, original_gfn, shadow_gfn)?;

        // Execute-only: any guest read or write of this page in the shadow
        // view traps, which is what detects kernel integrity checks.
        vmi.set_memory_access(original_gfn, self.view, MemoryAccess::X)?;

        Ok(())
    }

    /// Grows the reservation by one page and populates a fresh frame.
    fn allocate_shadow_frame(&mut self, vmi: &GuestCore<Driver>) -> Result<Gfn, TraceError> {
        vmi.set_max_memory(self.current_memory + arch::PAGE_SIZE)?;

        let gfn = match vmi.allocate_next_available_frame() {
            Ok(gfn) => gfn,
            Err(err) => {
                if let Err(err) = vmi.set_max_memory(self.current_memory) {
                    tracing::error!(%err, "failed to unwind the reservation raise");
                }
                return Err(err);
            }
        };

        self.current_memory += arch::PAGE_SIZE;
        Ok(gfn)
    }

    /// Frees a shadow frame and lowers the reservation accordingly.
    ///
    /// Returns `false` when a hypervisor call failed; the accounting is
    /// adjusted either way so teardown can continue.
    fn free_shadow_frame(&mut self, vmi: &GuestCore<Driver>, gfn: Gfn) -> bool {
        let mut ok = true;

        if let Err(err) = vmi.free_frame(gfn) {
            tracing::error!(%err, %gfn, "failed to free a shadow frame");
            ok = false;
        }

        self.current_memory -= arch::PAGE_SIZE;

        if let Err(err) = vmi.set_max_memory(self.current_memory) {
            tracing::error!(%err, "failed to lower the reservation");
            ok = false;
        }

        ok
    }

    /// Drops every page record, restoring the guest byte-exactly.
    ///
    /// For each record: the original bytes are written back over the
    /// emplaced opcodes, the watch is disarmed, the shadow mapping is
    /// removed and the frame is freed. Failed steps are logged and the
    /// remaining records are still processed; returns `false` when any
    /// step failed.
    pub fn clear(&mut self, vmi: &GuestCore<Driver>) -> bool {
        let mut ok = true;

        for record in std::mem::take(&mut self.records).into_values() {
            for &offset in record.children.keys() {
                let original = arch::pa_from_gfn(record.original_gfn) + offset as u64;
                let shadow = arch::pa_from_gfn(record.shadow_gfn) + offset as u64;

                match vmi.read_u8(original) {
                    Ok(byte) => {
                        if let Err(err) = vmi.write_u8(shadow, byte) {
                            tracing::error!(%err, %shadow, "failed to restore a breakpoint byte");
                            ok = false;
                        }
                    }
                    Err(err) => {
                        tracing::error!(%err, %original, "failed to read an original byte");
                        ok = false;
                    }
                }
            }

            if let Err(err) = vmi.set_memory_access(record.original_gfn, self.view, MemoryAccess::RWX)
            {
                tracing::error!(%err, gfn = %record.original_gfn, "failed to disarm the watch");
                ok = false;
            }

            if let Err(err) = vmi.reset_view_gfn(self.view, record.original_gfn) {
                tracing::error!(%err, gfn = %record.original_gfn, "failed to reset the mapping");
                ok = false;
            }

            ok &= self.free_shadow_frame(vmi, record.shadow_gfn);

            tracing::debug!(
                original_gfn = %record.original_gfn,
                shadow_gfn = %record.shadow_gfn,
                "shadow frame released"
            );
        }

        self.mappings.clear();
        ok
    }
}
