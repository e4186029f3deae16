mod hex;
pub(crate) mod macros;

use serde::{Deserialize, Serialize};

pub use self::hex::Hex;
use self::macros::impl_addr;

impl_addr!(Gfn, "Guest Frame Number");
impl_addr!(Pa, "Guest Physical Address");
impl_addr!(Va, "Guest Virtual Address");

impl Va {
    /// Checks if the virtual address is NULL.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A physical memory view identifier.
///
/// View `0` always denotes the default (unmodified) view of the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct View(pub u16);

impl std::fmt::Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A virtual CPU identifier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VcpuId(pub u16);

impl From<u16> for VcpuId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for VcpuId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags::bitflags! {
    /// Memory access permission flags.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct MemoryAccess: u8 {
        /// Read permission.
        const R = 0b00000001;

        /// Write permission.
        const W = 0b00000010;

        /// Execute permission.
        const X = 0b00000100;

        /// Combined Read and Write permissions.
        const RW = Self::R.bits() | Self::W.bits();

        /// Combined Read and Execute permissions.
        const RX = Self::R.bits() | Self::X.bits();

        /// Full access: Read, Write, and Execute permissions.
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

impl std::fmt::Display for MemoryAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut result = [b'-'; 3];

        if self.contains(MemoryAccess::R) {
            result[0] = b'r';
        }
        if self.contains(MemoryAccess::W) {
            result[1] = b'w';
        }
        if self.contains(MemoryAccess::X) {
            result[2] = b'x';
        }

        // SAFETY: The `result` array is always valid UTF-8.
        f.write_str(unsafe { std::str::from_utf8_unchecked(&result) })
    }
}

/// The operating system detected inside the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OsKind {
    /// A Linux guest.
    Linux,

    /// A Windows guest.
    Windows,

    /// An unrecognized guest.
    Unknown,
}

/// Information about the introspected guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestInfo {
    /// The size of a page in bytes.
    pub page_size: u64,

    /// The shift value to convert a page number to a page address.
    pub page_shift: u64,

    /// The maximum guest frame number.
    pub max_gfn: Gfn,

    /// The current maximum physical-memory reservation in bytes.
    pub memory: u64,

    /// The guest pointer width in bytes.
    pub address_width: u64,

    /// The number of virtual CPUs.
    pub vcpus: u16,

    /// The operating system running inside the guest.
    pub os: OsKind,
}
