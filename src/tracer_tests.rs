use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet, VecDeque},
    rc::Rc,
    sync::{Arc, Mutex},
    time::Duration,
};

use altrace_core::{
    EventInterrupt, EventMemoryAccess, EventMonitor, EventReason, EventResponse,
    EventResponseFlags, EventSinglestep, Gfn, GuestCore, GuestDriver, GuestEvent, GuestEvents,
    GuestInfo, GuestMemory, GuestOs, GuestPhysmap, GuestRegisters, GuestTranslate, GuestViews,
    GuestVmControl, MemoryAccess, OsKind, Pa, ProcessId, SyscallHandler, ThreadId, TraceError,
    UserState, Va, VcpuId, View,
    arch::{self, Registers},
};

use super::tracer::Tracer;

///////////////////////////////////////////////////////////////////////////////
// Mock Driver
///////////////////////////////////////////////////////////////////////////////

struct VcpuState {
    view: View,
    singlestep: bool,
}

/// A synthetic guest shared between the driver handed to the tracer and the
/// test body.
struct GuestState {
    pages: RefCell<HashMap<Gfn, Vec<u8>>>,
    translations: RefCell<HashMap<Va, Gfn>>,
    symbols: RefCell<HashMap<String, Va>>,
    pids: RefCell<HashMap<Pa, ProcessId>>,
    registers: RefCell<HashMap<VcpuId, Registers>>,

    max_gfn: Cell<Gfn>,
    max_memory: Cell<u64>,

    alt_views_enabled: Cell<bool>,
    views: RefCell<HashSet<View>>,
    next_view: Cell<u16>,
    remaps: RefCell<HashMap<(View, Gfn), Gfn>>,
    access: RefCell<HashMap<(View, Gfn), MemoryAccess>>,

    vcpus: RefCell<Vec<VcpuState>>,
    monitors: RefCell<HashSet<EventMonitor>>,
    queue: RefCell<VecDeque<GuestEvent>>,
    reinjected: Cell<usize>,
    paused: Cell<i32>,

    fail_allocate: Cell<bool>,
}

#[derive(Clone)]
struct MockDriver {
    state: Rc<GuestState>,
}

impl MockDriver {
    fn new() -> Self {
        Self {
            state: Rc::new(GuestState {
                pages: RefCell::new(HashMap::new()),
                translations: RefCell::new(HashMap::new()),
                symbols: RefCell::new(HashMap::new()),
                pids: RefCell::new(HashMap::new()),
                registers: RefCell::new(HashMap::new()),
                max_gfn: Cell::new(INIT_MAX_GFN),
                max_memory: Cell::new(INIT_MEMORY),
                alt_views_enabled: Cell::new(false),
                views: RefCell::new(HashSet::from([View(0)])),
                next_view: Cell::new(1),
                remaps: RefCell::new(HashMap::new()),
                access: RefCell::new(HashMap::new()),
                vcpus: RefCell::new(
                    (0..2)
                        .map(|_| VcpuState {
                            view: View(0),
                            singlestep: false,
                        })
                        .collect(),
                ),
                monitors: RefCell::new(HashSet::new()),
                queue: RefCell::new(VecDeque::new()),
                reinjected: Cell::new(0),
                paused: Cell::new(0),
                fail_allocate: Cell::new(false),
            }),
        }
    }

    /// Inserts a page at the given GFN, mapped at the given virtual address.
    fn insert_page(&self, va: Va, gfn: Gfn, content: Vec<u8>) {
        assert_eq!(content.len(), arch::PAGE_SIZE as usize);
        self.state.pages.borrow_mut().insert(gfn, content);
        self.state
            .translations
            .borrow_mut()
            .insert(va & arch::PAGE_MASK, gfn);
    }

    /// Reads a byte the way a VCPU running in `view` would.
    fn read_via_view(&self, view: View, pa: Pa) -> u8 {
        let gfn = arch::gfn_from_pa(pa);
        let gfn = *self.state.remaps.borrow().get(&(view, gfn)).unwrap_or(&gfn);
        self.state.pages.borrow()[&gfn][arch::pa_offset(pa) as usize]
    }

    /// Reads the 64-bit word at a physical address, bypassing views.
    fn read_word(&self, pa: Pa) -> u64 {
        let pages = self.state.pages.borrow();
        let page = &pages[&arch::gfn_from_pa(pa)];
        let offset = arch::pa_offset(pa) as usize;
        u64::from_le_bytes(page[offset..offset + 8].try_into().unwrap())
    }

    /// Overwrites the 64-bit word at a physical address.
    fn write_word(&self, pa: Pa, value: u64) {
        let mut pages = self.state.pages.borrow_mut();
        let page = pages.get_mut(&arch::gfn_from_pa(pa)).unwrap();
        let offset = arch::pa_offset(pa) as usize;
        page[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn vcpu(&self, vcpu: u16) -> (View, bool) {
        let vcpus = self.state.vcpus.borrow();
        (vcpus[vcpu as usize].view, vcpus[vcpu as usize].singlestep)
    }
}

impl GuestDriver for MockDriver {
    fn info(&self) -> Result<GuestInfo, TraceError> {
        Ok(GuestInfo {
            page_size: arch::PAGE_SIZE,
            page_shift: arch::PAGE_SHIFT,
            max_gfn: self.state.max_gfn.get(),
            memory: self.state.max_memory.get(),
            address_width: 8,
            vcpus: 2,
            os: OsKind::Linux,
        })
    }
}

impl GuestMemory for MockDriver {
    fn read_page(&self, gfn: Gfn) -> Result<Vec<u8>, TraceError> {
        self.state
            .pages
            .borrow()
            .get(&gfn)
            .cloned()
            .ok_or(TraceError::Other("page not found"))
    }

    fn write_page(&self, gfn: Gfn, offset: u64, content: &[u8]) -> Result<(), TraceError> {
        let mut pages = self.state.pages.borrow_mut();
        let page = pages.get_mut(&gfn).ok_or(TraceError::Other("page not found"))?;

        let offset = offset as usize;
        page[offset..offset + content.len()].copy_from_slice(content);
        Ok(())
    }
}

impl GuestTranslate for MockDriver {
    fn translate_kernel_address(&self, va: Va) -> Result<Pa, TraceError> {
        let translations = self.state.translations.borrow();
        let gfn = translations
            .get(&(va & arch::PAGE_MASK))
            .ok_or_else(|| TraceError::page_fault(va))?;
        Ok(arch::pa_from_gfn(*gfn) + arch::va_offset(va))
    }

    fn resolve_kernel_symbol(&self, name: &str) -> Result<Va, TraceError> {
        self.state
            .symbols
            .borrow()
            .get(name)
            .copied()
            .ok_or_else(|| TraceError::Symbol(name.into()))
    }

    fn process_id_from_root(&self, root: Pa) -> Result<ProcessId, TraceError> {
        self.state
            .pids
            .borrow()
            .get(&root)
            .copied()
            .ok_or(TraceError::Other("unknown translation root"))
    }
}

impl GuestRegisters for MockDriver {
    fn registers(&self, vcpu: VcpuId) -> Result<Registers, TraceError> {
        Ok(self
            .state
            .registers
            .borrow()
            .get(&vcpu)
            .copied()
            .unwrap_or_default())
    }
}

impl GuestViews for MockDriver {
    fn set_alternate_views_enabled(&self, enabled: bool) -> Result<(), TraceError> {
        self.state.alt_views_enabled.set(enabled);
        Ok(())
    }

    fn default_view(&self) -> View {
        View(0)
    }

    fn create_view(&self, _default_access: MemoryAccess) -> Result<View, TraceError> {
        let view = View(self.state.next_view.get());
        self.state.next_view.set(view.0 + 1);
        self.state.views.borrow_mut().insert(view);
        Ok(view)
    }

    fn destroy_view(&self, view: View) -> Result<(), TraceError> {
        match self.state.views.borrow_mut().remove(&view) {
            true => Ok(()),
            false => Err(TraceError::ViewNotFound),
        }
    }

    fn switch_to_view(&self, view: View) -> Result<(), TraceError> {
        if !self.state.views.borrow().contains(&view) {
            return Err(TraceError::ViewNotFound);
        }

        for vcpu in self.state.vcpus.borrow_mut().iter_mut() {
            vcpu.view = view;
        }
        Ok(())
    }

    fn change_view_gfn(&self, view: View, old_gfn: Gfn, new_gfn: Gfn) -> Result<(), TraceError> {
        if !self.state.views.borrow().contains(&view) {
            return Err(TraceError::ViewNotFound);
        }

        self.state.remaps.borrow_mut().insert((view, old_gfn), new_gfn);
        Ok(())
    }

    fn reset_view_gfn(&self, view: View, gfn: Gfn) -> Result<(), TraceError> {
        if !self.state.views.borrow().contains(&view) {
            return Err(TraceError::ViewNotFound);
        }

        self.state.remaps.borrow_mut().remove(&(view, gfn));
        Ok(())
    }

    fn set_memory_access(
        &self,
        gfn: Gfn,
        view: View,
        access: MemoryAccess,
    ) -> Result<(), TraceError> {
        self.state.access.borrow_mut().insert((view, gfn), access);
        Ok(())
    }
}

impl GuestPhysmap for MockDriver {
    fn set_max_memory(&self, bytes: u64) -> Result<(), TraceError> {
        self.state.max_memory.set(bytes);
        Ok(())
    }

    fn allocate_frame(&self, gfn: Gfn) -> Result<(), TraceError> {
        if self.state.fail_allocate.get() {
            return Err(TraceError::Other("populate failed"));
        }

        self.state
            .pages
            .borrow_mut()
            .insert(gfn, vec![0u8; arch::PAGE_SIZE as usize]);

        if gfn > self.state.max_gfn.get() {
            self.state.max_gfn.set(gfn);
        }
        Ok(())
    }

    fn free_frame(&self, gfn: Gfn) -> Result<(), TraceError> {
        match self.state.pages.borrow_mut().remove(&gfn) {
            Some(_) => Ok(()),
            None => Err(TraceError::Other("frame not allocated")),
        }
    }
}

impl GuestEvents for MockDriver {
    fn monitor_enable(&self, monitor: EventMonitor) -> Result<(), TraceError> {
        self.state.monitors.borrow_mut().insert(monitor);
        Ok(())
    }

    fn monitor_disable(&self, monitor: EventMonitor) -> Result<(), TraceError> {
        self.state.monitors.borrow_mut().remove(&monitor);
        Ok(())
    }

    fn wait_for_event(
        &self,
        _timeout: Duration,
        mut handler: impl FnMut(&GuestEvent) -> EventResponse,
    ) -> Result<(), TraceError> {
        let event = match self.state.queue.borrow_mut().pop_front() {
            Some(event) => event,
            None => return Err(TraceError::Timeout),
        };

        let response = handler(&event);
        self.apply_response(event.vcpu_id(), response);
        Ok(())
    }
}

impl MockDriver {
    fn apply_response(&self, vcpu: VcpuId, response: EventResponse) {
        if response.flags.contains(EventResponseFlags::REINJECT_INTERRUPT) {
            self.state.reinjected.set(self.state.reinjected.get() + 1);
        }

        {
            let mut vcpus = self.state.vcpus.borrow_mut();
            let state = &mut vcpus[vcpu.0 as usize];

            if response.flags.contains(EventResponseFlags::TOGGLE_SINGLESTEP) {
                state.singlestep = !state.singlestep;
            }

            if let Some(view) = response.view {
                state.view = view;
            }
        }

        if let Some(registers) = response.registers {
            self.state.registers.borrow_mut().insert(vcpu, registers);
        }
    }
}

impl GuestVmControl for MockDriver {
    fn pause(&self) -> Result<(), TraceError> {
        self.state.paused.set(self.state.paused.get() + 1);
        Ok(())
    }

    fn resume(&self) -> Result<(), TraceError> {
        self.state.paused.set(self.state.paused.get() - 1);
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////////////
// Mock OS Adapter
///////////////////////////////////////////////////////////////////////////////

/// Reports the return point at a fixed offset past the syscall entry,
/// matching the dispatch call in the synthetic entry page.
struct MockOs;

impl GuestOs<MockDriver> for MockOs {
    fn find_return_point(
        &self,
        _vmi: &GuestCore<MockDriver>,
        registers: &Registers,
    ) -> Result<Va, TraceError> {
        Ok(Va(registers.msr_lstar + RETURN_POINT_OFFSET))
    }
}

///////////////////////////////////////////////////////////////////////////////
// Test Helpers
///////////////////////////////////////////////////////////////////////////////

const LSTAR: u64 = 0xffff_ffff_81a0_0000;
const ENTRY_GFN: Gfn = Gfn(0x200);

/// The dispatch call ends 8 bytes into the synthetic entry handler.
const RETURN_POINT_OFFSET: u64 = 8;
const TRAMPOLINE_OFFSET: u64 = 0x20;

const TEXT_GFN: Gfn = Gfn(0x100);
const SYM_A: Va = Va(0xffff_ffff_8100_1234);
const SYM_B: Va = Va(0xffff_ffff_8100_1240);
const SYM_A_BYTE: u8 = 0x55;
const SYM_B_BYTE: u8 = 0x53;

const TEXT2_GFN: Gfn = Gfn(0x101);
const SYM_C: Va = Va(0xffff_ffff_8100_2000);

const STACK_GFN: Gfn = Gfn(0x300);
const STACK_RSP: u64 = 0xffff_8800_dead_be00;

const STACK2_GFN: Gfn = Gfn(0x301);
const STACK2_RSP: u64 = 0xffff_8800_feed_f800;

const ROOT: Pa = Pa(0x1000);
const PID: ProcessId = ProcessId(4321);

const INIT_MAX_GFN: Gfn = Gfn(0x3fff);
const INIT_MEMORY: u64 = 512 * 1024 * 1024;

fn return_point() -> Va {
    Va(LSTAR + RETURN_POINT_OFFSET)
}

fn trampoline() -> Va {
    Va(LSTAR + TRAMPOLINE_OFFSET)
}

/// Builds the synthetic guest: an instrumentable text page, the syscall
/// entry handler with a reusable breakpoint byte, and two kernel stacks
/// whose top slots hold the expected return point.
fn new_guest() -> MockDriver {
    let driver = MockDriver::new();

    let mut text = vec![0x90u8; arch::PAGE_SIZE as usize];
    text[arch::va_offset(SYM_A) as usize] = SYM_A_BYTE;
    text[arch::va_offset(SYM_B) as usize] = SYM_B_BYTE;
    driver.insert_page(SYM_A, TEXT_GFN, text);

    driver.insert_page(SYM_C, TEXT2_GFN, vec![0x90u8; arch::PAGE_SIZE as usize]);

    // swapgs; call +0x1234; ...; int3 (the trampoline byte)
    let mut entry = vec![0x90u8; arch::PAGE_SIZE as usize];
    entry[..3].copy_from_slice(&[0x0f, 0x01, 0xf8]);
    entry[3..8].copy_from_slice(&[0xe8, 0x34, 0x12, 0x00, 0x00]);
    entry[TRAMPOLINE_OFFSET as usize] = arch::BREAKPOINT;
    driver.insert_page(Va(LSTAR), ENTRY_GFN, entry);

    let mut stack = vec![0u8; arch::PAGE_SIZE as usize];
    let offset = arch::va_offset(Va(STACK_RSP)) as usize;
    stack[offset..offset + 8].copy_from_slice(&return_point().0.to_le_bytes());
    driver.insert_page(Va(STACK_RSP), STACK_GFN, stack);

    let mut stack2 = vec![0u8; arch::PAGE_SIZE as usize];
    let offset = arch::va_offset(Va(STACK2_RSP)) as usize;
    stack2[offset..offset + 8].copy_from_slice(&return_point().0.to_le_bytes());
    driver.insert_page(Va(STACK2_RSP), STACK2_GFN, stack2);

    driver.state.symbols.borrow_mut().insert("sym_a".into(), SYM_A);
    driver.state.symbols.borrow_mut().insert("sym_b".into(), SYM_B);
    driver.state.symbols.borrow_mut().insert("sym_c".into(), SYM_C);

    driver.state.pids.borrow_mut().insert(ROOT, PID);

    let registers = Registers {
        cr3: ROOT.0,
        msr_lstar: LSTAR,
        ..Default::default()
    };
    driver.state.registers.borrow_mut().insert(VcpuId(0), registers);
    driver.state.registers.borrow_mut().insert(VcpuId(1), registers);

    driver
}

fn new_tracer() -> (Tracer<MockDriver, MockOs>, MockDriver) {
    let driver = new_guest();
    let mock = driver.clone();

    let tracer = Tracer::new(GuestCore::new(driver), MockOs).unwrap();
    (tracer, mock)
}

fn event_registers(rip: Va, rsp: u64) -> Registers {
    Registers {
        rip: rip.0,
        rsp,
        cr3: ROOT.0,
        msr_lstar: LSTAR,
        ..Default::default()
    }
}

/// Queues an event and services it through the tracer's dispatcher the same
/// way the event loop would.
fn deliver(tracer: &mut Tracer<MockDriver, MockOs>, event: GuestEvent) {
    tracer
        .vmi
        .driver()
        .state
        .queue
        .borrow_mut()
        .push_back(event);

    let vmi = &tracer.vmi;
    let dispatcher = &mut tracer.dispatcher;
    vmi.wait_for_event(Duration::from_millis(0), |event| {
        dispatcher.handle_event(vmi, event)
    })
    .unwrap();
}

fn deliver_interrupt(tracer: &mut Tracer<MockDriver, MockOs>, vcpu: u16, gla: Va, rsp: u64) {
    let event = GuestEvent::new(
        VcpuId(vcpu),
        Some(tracer.view()),
        event_registers(gla, rsp),
        EventReason::Interrupt(EventInterrupt { gfn: Gfn(0), gla }),
    );
    deliver(tracer, event);
}

fn deliver_memory_access(
    tracer: &mut Tracer<MockDriver, MockOs>,
    vcpu: u16,
    gfn: Gfn,
    access: MemoryAccess,
) {
    let event = GuestEvent::new(
        VcpuId(vcpu),
        Some(tracer.view()),
        event_registers(Va(0xffff_ffff_8180_0000), 0),
        EventReason::MemoryAccess(EventMemoryAccess {
            pa: arch::pa_from_gfn(gfn),
            va: Va(0xffff_ffff_8100_0000),
            access,
        }),
    );
    deliver(tracer, event);
}

fn deliver_singlestep(tracer: &mut Tracer<MockDriver, MockOs>, vcpu: u16) {
    let event = GuestEvent::new(
        VcpuId(vcpu),
        Some(View(0)),
        event_registers(Va(0), 0),
        EventReason::Singlestep(EventSinglestep { gfn: Gfn(0) }),
    );
    deliver(tracer, event);
}

/// Records every callback invocation; the entry state round-trips the
/// thread identifier so mismatched dispatch is visible.
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(ProcessId, ThreadId)>>,
    returns: Mutex<Vec<(ProcessId, ThreadId, Option<ThreadId>)>>,
}

impl Recorder {
    fn hooked() -> (Arc<Self>, Arc<dyn SyscallHandler<MockDriver>>) {
        let recorder = Arc::new(Self::default());
        let handler: Arc<dyn SyscallHandler<MockDriver>> = recorder.clone();
        (recorder, handler)
    }
}

impl SyscallHandler<MockDriver> for Recorder {
    fn enter(
        &self,
        _vmi: &GuestCore<MockDriver>,
        _event: &GuestEvent,
        pid: ProcessId,
        thread: ThreadId,
    ) -> Option<UserState> {
        self.calls.lock().unwrap().push((pid, thread));
        Some(Box::new(thread))
    }

    fn exit(
        &self,
        _vmi: &GuestCore<MockDriver>,
        _event: &GuestEvent,
        pid: ProcessId,
        thread: ThreadId,
        state: Option<UserState>,
    ) {
        let state = state.and_then(|state| state.downcast::<ThreadId>().ok().map(|b| *b));
        self.returns.lock().unwrap().push((pid, thread, state));
    }
}

fn stack_slot() -> Pa {
    arch::pa_from_gfn(STACK_GFN) + arch::va_offset(Va(STACK_RSP))
}

///////////////////////////////////////////////////////////////////////////////
// Installation
///////////////////////////////////////////////////////////////////////////////

#[test]
fn install_emplaces_only_shadow_bytes() {
    let (mut tracer, mock) = new_tracer();
    let (_recorder, handler) = Recorder::hooked();

    assert!(tracer.attach("sym_a", handler).unwrap());
    assert_eq!(tracer.shadow_page_count(), 1);

    let shadow_gfn = Gfn(INIT_MAX_GFN.0 + 1);
    let offset = arch::va_offset(SYM_A);

    // The shadow copy carries the opcode, the original byte is untouched.
    let shadow_pa = arch::pa_from_gfn(shadow_gfn) + offset;
    let original_pa = arch::pa_from_gfn(TEXT_GFN) + offset;
    assert_eq!(mock.read_via_view(View(0), shadow_pa), arch::BREAKPOINT);
    assert_eq!(mock.read_via_view(View(0), original_pa), SYM_A_BYTE);

    // The shadow view observes the opcode at the original frame.
    assert_eq!(mock.read_via_view(tracer.view(), original_pa), arch::BREAKPOINT);

    // Reads and writes of the original frame trap in the shadow view.
    let access = mock.state.access.borrow()[&(tracer.view(), TEXT_GFN)];
    assert_eq!(access, MemoryAccess::X);

    // The guest is not left paused behind.
    assert_eq!(mock.state.paused.get(), 0);
}

#[test]
fn two_symbols_share_one_page_record() {
    let (mut tracer, mock) = new_tracer();
    let (_recorder, handler) = Recorder::hooked();

    assert!(tracer.attach("sym_a", handler.clone()).unwrap());
    assert!(tracer.attach("sym_b", handler).unwrap());

    assert_eq!(tracer.shadow_page_count(), 1);
    assert_eq!(tracer.current_memory(), INIT_MEMORY + arch::PAGE_SIZE);

    let shadow_pa = arch::pa_from_gfn(Gfn(INIT_MAX_GFN.0 + 1));
    assert_eq!(
        mock.read_via_view(View(0), shadow_pa + arch::va_offset(SYM_A)),
        arch::BREAKPOINT
    );
    assert_eq!(
        mock.read_via_view(View(0), shadow_pa + arch::va_offset(SYM_B)),
        arch::BREAKPOINT
    );
}

#[test]
fn install_is_idempotent_and_keeps_the_first_callbacks() {
    let (mut tracer, _mock) = new_tracer();
    let (first, first_handler) = Recorder::hooked();
    let (second, second_handler) = Recorder::hooked();

    assert!(tracer.attach("sym_a", first_handler).unwrap());
    assert!(tracer.attach("sym_a", second_handler).unwrap());

    assert_eq!(tracer.shadow_page_count(), 1);
    assert_eq!(tracer.current_memory(), INIT_MEMORY + arch::PAGE_SIZE);

    tracer.start().unwrap();
    deliver_interrupt(&mut tracer, 0, SYM_A, STACK_RSP);

    assert_eq!(first.calls.lock().unwrap().len(), 1);
    assert!(second.calls.lock().unwrap().is_empty());
}

#[test]
fn unknown_symbols_are_skipped() {
    let (mut tracer, _mock) = new_tracer();
    let (_recorder, handler) = Recorder::hooked();

    assert!(!tracer.attach("sym_missing", handler).unwrap());
    assert_eq!(tracer.shadow_page_count(), 0);
    assert_eq!(tracer.current_memory(), INIT_MEMORY);
}

#[test]
fn failed_allocation_unwinds_the_reservation() {
    let (mut tracer, mock) = new_tracer();
    let (_recorder, handler) = Recorder::hooked();

    mock.state.fail_allocate.set(true);

    assert!(tracer.attach("sym_a", handler).is_err());
    assert_eq!(tracer.shadow_page_count(), 0);
    assert_eq!(tracer.current_memory(), INIT_MEMORY);
    assert_eq!(mock.state.max_memory.get(), INIT_MEMORY);
}

///////////////////////////////////////////////////////////////////////////////
// Startup Discovery
///////////////////////////////////////////////////////////////////////////////

#[test]
fn startup_resolves_trampoline_and_return_point() {
    let (mut tracer, mock) = new_tracer();

    tracer.start().unwrap();

    assert_eq!(tracer.trampoline(), trampoline());
    assert_eq!(tracer.return_point(), return_point());

    // The shadow view is now active on every VCPU.
    assert_eq!(mock.vcpu(0).0, tracer.view());
    assert_eq!(mock.vcpu(1).0, tracer.view());

    let monitors = mock.state.monitors.borrow();
    assert!(monitors.contains(&EventMonitor::Interrupt));
    assert!(monitors.contains(&EventMonitor::Singlestep));
}

#[cfg(feature = "os-linux")]
#[test]
fn linux_adapter_locates_the_dispatch_return_point() {
    let driver = new_guest();

    let tracer = Tracer::new(GuestCore::new(driver), altrace_os_linux::LinuxOs::new());
    let mut tracer = tracer.unwrap();

    tracer.start().unwrap();
    assert_eq!(tracer.return_point(), return_point());
}

///////////////////////////////////////////////////////////////////////////////
// Dispatch
///////////////////////////////////////////////////////////////////////////////

#[test]
fn single_call_and_return() {
    let (mut tracer, mock) = new_tracer();
    let (recorder, handler) = Recorder::hooked();

    tracer.attach("sym_a", handler).unwrap();
    tracer.start().unwrap();

    let thread = ThreadId(Va(STACK_RSP));

    // Call-site hit: the entry callback runs and the return slot now
    // points at the trampoline.
    deliver_interrupt(&mut tracer, 0, SYM_A, STACK_RSP);

    assert_eq!(*recorder.calls.lock().unwrap(), vec![(PID, thread)]);
    assert_eq!(mock.read_word(stack_slot()), trampoline().0);
    assert_eq!(tracer.pending_calls(), 1);

    // The VCPU steps over the original instruction in the default view.
    assert_eq!(mock.vcpu(0), (View(0), true));
    deliver_singlestep(&mut tracer, 0);
    assert_eq!(mock.vcpu(0), (tracer.view(), false));

    // Return-site hit: by now the return has popped the slot.
    deliver_interrupt(&mut tracer, 0, trampoline(), STACK_RSP + 8);

    assert_eq!(
        *recorder.returns.lock().unwrap(),
        vec![(PID, thread, Some(thread))]
    );
    assert_eq!(tracer.pending_calls(), 0);

    // The VCPU resumes after the original call site.
    let registers = mock.state.registers.borrow()[&VcpuId(0)];
    assert_eq!(registers.instruction_pointer(), return_point());
}

#[test]
fn unexpected_return_address_is_not_hijacked() {
    let (mut tracer, mock) = new_tracer();
    let (recorder, handler) = Recorder::hooked();

    tracer.attach("sym_a", handler).unwrap();
    tracer.start().unwrap();

    // The stack slot holds something other than the dispatch return point.
    mock.write_word(stack_slot(), 0xffff_ffff_8123_4567);

    deliver_interrupt(&mut tracer, 0, SYM_A, STACK_RSP);

    assert!(recorder.calls.lock().unwrap().is_empty());
    assert_eq!(tracer.pending_calls(), 0);
    assert_eq!(mock.read_word(stack_slot()), 0xffff_ffff_8123_4567);

    // The breakpoint is still stepped over, not reinjected.
    assert_eq!(mock.vcpu(0), (View(0), true));
    assert_eq!(mock.state.reinjected.get(), 0);
}

#[test]
fn foreign_breakpoints_are_reinjected() {
    let (mut tracer, mock) = new_tracer();
    let (recorder, handler) = Recorder::hooked();

    tracer.attach("sym_a", handler).unwrap();
    tracer.start().unwrap();

    // Translatable address on an instrumented page, but no record there.
    deliver_interrupt(&mut tracer, 0, Va(0xffff_ffff_8100_1300), STACK_RSP);
    assert_eq!(mock.state.reinjected.get(), 1);

    // Address the engine cannot even translate.
    deliver_interrupt(&mut tracer, 0, Va(0xffff_ffff_9999_0000), STACK_RSP);
    assert_eq!(mock.state.reinjected.get(), 2);

    assert!(recorder.calls.lock().unwrap().is_empty());

    // No single-step window was opened for a foreign interrupt.
    assert_eq!(mock.vcpu(0), (tracer.view(), false));
}

#[test]
fn stale_return_site_hit_is_ignored() {
    let (mut tracer, mock) = new_tracer();

    tracer.start().unwrap();

    deliver_interrupt(&mut tracer, 0, trampoline(), STACK_RSP + 8);

    assert_eq!(tracer.pending_calls(), 0);
    assert_eq!(mock.state.reinjected.get(), 0);
    assert_eq!(mock.vcpu(0), (tracer.view(), false));
}

#[test]
fn monitored_page_access_detours_one_vcpu() {
    let (mut tracer, mock) = new_tracer();
    let (recorder, handler) = Recorder::hooked();

    tracer.attach("sym_a", handler).unwrap();
    tracer.start().unwrap();

    // A kernel integrity check reads the instrumented page on VCPU 1.
    deliver_memory_access(&mut tracer, 1, TEXT_GFN, MemoryAccess::R);

    // Only VCPU 1 detours through the default view.
    assert_eq!(mock.vcpu(1), (View(0), true));
    assert_eq!(mock.vcpu(0), (tracer.view(), false));

    // No callback is involved.
    assert!(recorder.calls.lock().unwrap().is_empty());

    // The single-step completion re-arms the shadow view.
    deliver_singlestep(&mut tracer, 1);
    assert_eq!(mock.vcpu(1), (tracer.view(), false));
}

#[test]
fn concurrent_calls_keep_distinct_records() {
    let (mut tracer, mock) = new_tracer();
    let (recorder, handler) = Recorder::hooked();

    tracer.attach("sym_a", handler).unwrap();
    tracer.start().unwrap();

    let thread_a = ThreadId(Va(STACK_RSP));
    let thread_b = ThreadId(Va(STACK2_RSP));

    // Two VCPUs hit the same call site; the events interleave.
    deliver_interrupt(&mut tracer, 0, SYM_A, STACK_RSP);
    deliver_interrupt(&mut tracer, 1, SYM_A, STACK2_RSP);
    assert_eq!(tracer.pending_calls(), 2);

    // Returns arrive in the opposite order; each dispatches to its own
    // record, carrying its own state.
    deliver_interrupt(&mut tracer, 1, trampoline(), STACK2_RSP + 8);
    deliver_interrupt(&mut tracer, 0, trampoline(), STACK_RSP + 8);

    assert_eq!(
        *recorder.returns.lock().unwrap(),
        vec![
            (PID, thread_b, Some(thread_b)),
            (PID, thread_a, Some(thread_a)),
        ]
    );
    assert_eq!(tracer.pending_calls(), 0);
    assert_eq!(mock.state.reinjected.get(), 0);
}

///////////////////////////////////////////////////////////////////////////////
// Teardown
///////////////////////////////////////////////////////////////////////////////

#[test]
fn teardown_restores_the_guest_byte_exactly() {
    let (mut tracer, mock) = new_tracer();
    let (_recorder, handler) = Recorder::hooked();

    tracer.attach("sym_a", handler.clone()).unwrap();
    tracer.attach("sym_b", handler.clone()).unwrap();
    tracer.attach("sym_c", handler).unwrap();
    assert_eq!(tracer.current_memory(), INIT_MEMORY + 2 * arch::PAGE_SIZE);

    let view = tracer.view();
    tracer.teardown().unwrap();

    // The original bytes are visible through both views again.
    let pa_a = arch::pa_from_gfn(TEXT_GFN) + arch::va_offset(SYM_A);
    let pa_b = arch::pa_from_gfn(TEXT_GFN) + arch::va_offset(SYM_B);
    assert_eq!(mock.read_via_view(View(0), pa_a), SYM_A_BYTE);
    assert_eq!(mock.read_via_view(View(0), pa_b), SYM_B_BYTE);
    assert_eq!(mock.read_via_view(view, pa_a), SYM_A_BYTE);
    assert_eq!(mock.read_via_view(view, pa_b), SYM_B_BYTE);

    // The shadow frames are gone and the reservation is back at its
    // initial size.
    assert!(!mock.state.pages.borrow().contains_key(&Gfn(INIT_MAX_GFN.0 + 1)));
    assert!(!mock.state.pages.borrow().contains_key(&Gfn(INIT_MAX_GFN.0 + 2)));
    assert_eq!(tracer.current_memory(), INIT_MEMORY);
    assert_eq!(mock.state.max_memory.get(), INIT_MEMORY);

    // The shadow view and the alternate-view machinery are released.
    assert!(!mock.state.views.borrow().contains(&view));
    assert!(!mock.state.alt_views_enabled.get());
    assert_eq!(mock.vcpu(0).0, View(0));

    assert_eq!(mock.state.paused.get(), 0);
}

#[test]
fn teardown_restores_hijacked_return_slots() {
    let (mut tracer, mock) = new_tracer();
    let (recorder, handler) = Recorder::hooked();

    tracer.attach("sym_a", handler).unwrap();
    tracer.start().unwrap();

    deliver_interrupt(&mut tracer, 0, SYM_A, STACK_RSP);
    assert_eq!(mock.read_word(stack_slot()), trampoline().0);

    tracer.quit();
    tracer.teardown().unwrap();

    // The kernel will return through the real return point, not through a
    // trampoline nobody services anymore.
    assert_eq!(mock.read_word(stack_slot()), return_point().0);
    assert_eq!(tracer.pending_calls(), 0);

    // The exit callback is not faked for a call that never returned.
    assert!(recorder.returns.lock().unwrap().is_empty());
}

#[test]
fn teardown_is_idempotent() {
    let (mut tracer, _mock) = new_tracer();
    let (_recorder, handler) = Recorder::hooked();

    tracer.attach("sym_a", handler).unwrap();
    tracer.teardown().unwrap();
    tracer.teardown().unwrap();
}
