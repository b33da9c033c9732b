//! Boot information
//!
//! The bootloader hands the entry point a Multiboot2 information structure;
//! `multiboot2::parse` walks it once and produces the typed [`BootInfo`]
//! consumed by the rest of bring-up. The reader never modifies the
//! structure; the memory it lives in is assumed valid until the physical
//! memory manager claims the low region.

pub mod multiboot2;

/// How the machine was booted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    /// Legacy BIOS (no EFI tags present)
    Bios,
    /// 32-bit EFI (EFI32 system-table tag)
    Efi32,
    /// 64-bit EFI (EFI64 system-table tag)
    Efi64,
}

/// Kind of memory region as reported by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Available RAM that can be freely used
    Available,
    /// Reserved (do not use)
    Reserved,
    /// ACPI tables; reclaimable after they have been parsed
    AcpiReclaimable,
    /// ACPI non-volatile storage; must be preserved
    AcpiNvs,
    /// Defective RAM
    BadMemory,
    /// A type value this kernel does not recognise
    Unknown(u32),
}

impl MemoryRegionKind {
    pub fn from_raw(value: u32) -> Self {
        match value {
            1 => Self::Available,
            2 => Self::Reserved,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::BadMemory,
            other => Self::Unknown(other),
        }
    }

    /// Usable for general allocation?
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Available)
    }
}

/// One `(base, length, kind)` triple from the memory-map tag.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    pub fn end(&self) -> u64 {
        self.base + self.length
    }
}

/// Framebuffer pixel layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferKind {
    /// Indexed color with a palette
    Indexed,
    /// Direct RGB
    Rgb,
    /// EGA text mode (the VGA console case)
    Text,
    Unknown(u8),
}

/// RGB channel position/size, valid for [`FramebufferKind::Rgb`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RgbFields {
    pub red_pos: u8,
    pub red_size: u8,
    pub green_pos: u8,
    pub green_size: u8,
    pub blue_pos: u8,
    pub blue_size: u8,
}

/// Framebuffer geometry from the Multiboot2 framebuffer tag.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub addr: u64,
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u8,
    pub kind: FramebufferKind,
    pub rgb: RgbFields,
}

/// A boot module loaded alongside the kernel.
#[derive(Debug, Clone, Copy)]
pub struct BootModule {
    pub start: u64,
    pub end: u64,
}

/// Maximum memory-map entries retained. QEMU reports well under ten;
/// real firmware stays below this too.
pub const MAX_MEMORY_REGIONS: usize = 64;

/// Maximum boot modules retained.
pub const MAX_MODULES: usize = 16;

/// Strongly-typed boot information, borrowed from the Multiboot2 structure.
#[derive(Debug)]
pub struct BootInfo<'a> {
    pub boot_mode: BootMode,
    pub memory_map: heapless::Vec<MemoryRegion, MAX_MEMORY_REGIONS>,
    pub modules: heapless::Vec<BootModule, MAX_MODULES>,
    pub framebuffer: Option<FramebufferInfo>,
    pub cmdline: Option<&'a str>,
    pub bootloader_name: Option<&'a str>,
    /// Basic mem info tag: KiB of lower/upper memory, if reported.
    pub basic_mem: Option<(u32, u32)>,
    pub efi_system_table: Option<u64>,
    pub efi_image_handle: Option<u64>,
    /// Set when the bootloader did not call ExitBootServices.
    pub efi_boot_services: bool,
}

impl<'a> BootInfo<'a> {
    pub(crate) fn empty() -> Self {
        Self {
            boot_mode: BootMode::Bios,
            memory_map: heapless::Vec::new(),
            modules: heapless::Vec::new(),
            framebuffer: None,
            cmdline: None,
            bootloader_name: None,
            basic_mem: None,
            efi_system_table: None,
            efi_image_handle: None,
            efi_boot_services: false,
        }
    }

    /// Total bytes of available RAM in the memory map.
    pub fn available_bytes(&self) -> u64 {
        self.memory_map
            .iter()
            .filter(|r| r.kind.is_usable())
            .map(|r| r.length)
            .sum()
    }
}
