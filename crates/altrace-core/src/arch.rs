//! AMD64 architecture constants and register image.
//!
//! The engine targets x86-64 guests exclusively, so the architecture layer
//! is a set of concrete constants and conversions rather than a trait.

use crate::{Gfn, Pa, Va};

/// The size of a memory page in bytes.
pub const PAGE_SIZE: u64 = 0x1000;

/// The number of bits to shift when converting between frame numbers and
/// physical addresses.
pub const PAGE_SHIFT: u64 = 12;

/// A bitmask that isolates the page-aligned part of an address.
pub const PAGE_MASK: u64 = 0xffff_ffff_ffff_f000;

/// The machine code of the one-byte breakpoint instruction (`INT3`).
pub const BREAKPOINT: u8 = 0xcc;

/// Converts a guest physical address to a guest frame number.
pub fn gfn_from_pa(pa: Pa) -> Gfn {
    Gfn(pa.0 >> PAGE_SHIFT)
}

/// Converts a guest frame number to a guest physical address.
pub fn pa_from_gfn(gfn: Gfn) -> Pa {
    Pa(gfn.0 << PAGE_SHIFT)
}

/// Extracts the offset within a page from a physical address.
pub fn pa_offset(pa: Pa) -> u64 {
    pa.0 & !PAGE_MASK
}

/// Extracts the offset within a page from a virtual address.
pub fn va_offset(va: Va) -> u64 {
    va.0 & !PAGE_MASK
}

/// The state of the CPU registers delivered with an event.
#[expect(missing_docs)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,

    pub cr3: u64,

    pub msr_lstar: u64,
}

impl Registers {
    /// Returns the current value of the instruction pointer.
    pub fn instruction_pointer(&self) -> Va {
        Va(self.rip)
    }

    /// Sets the value of the instruction pointer.
    pub fn set_instruction_pointer(&mut self, ip: Va) {
        self.rip = ip.0;
    }

    /// Returns the current value of the stack pointer.
    pub fn stack_pointer(&self) -> Va {
        Va(self.rsp)
    }

    /// Returns the physical address of the root of the current page table
    /// hierarchy (`CR3` with the PCID bits masked off).
    pub fn translation_root(&self) -> Pa {
        Pa(self.cr3 & 0x0000_ffff_ffff_f000)
    }
}
