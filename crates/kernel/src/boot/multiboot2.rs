//! Multiboot2 information parsing
//!
//! The information structure is an 8-byte-aligned header
//! `(total_size, reserved)` followed by a sequence of 8-byte-aligned tags,
//! each `(type: u32, size: u32, payload)`, terminated by an `End` tag
//! `(type=0, size=8)`:
//!
//! ```text
//! ┌──────────────┐
//! │ total_size   │ u32: size of the whole structure, this field included
//! │ reserved     │ u32: must be 0
//! ├──────────────┤
//! │ Tag 0        │ (type, size, payload), 8-byte aligned
//! ├──────────────┤
//! │ Tag 1 ...    │
//! ├──────────────┤
//! │ End tag      │ type=0, size=8
//! └──────────────┘
//! ```
//!
//! Unrecognised tag types are skipped; the reader never writes to the
//! structure. Boot-mode detection prefers the EFI64 system-table tag, then
//! EFI32, else BIOS.

use super::{
    BootInfo, BootMode, BootModule, FramebufferInfo, FramebufferKind, MemoryRegion,
    MemoryRegionKind, RgbFields,
};

/// Magic value the bootloader leaves in EAX.
pub const BOOTLOADER_MAGIC: u32 = 0x36D76289;

/// Tags are 8-byte aligned on the wire.
const TAG_ALIGN: usize = 8;

// Tag types this kernel recognises.
const TAG_END: u32 = 0;
const TAG_CMDLINE: u32 = 1;
const TAG_BOOT_LOADER_NAME: u32 = 2;
const TAG_MODULE: u32 = 3;
const TAG_BASIC_MEMINFO: u32 = 4;
const TAG_MMAP: u32 = 6;
const TAG_FRAMEBUFFER: u32 = 8;
const TAG_EFI32: u32 = 11;
const TAG_EFI64: u32 = 12;
const TAG_EFI_BS: u32 = 18;
const TAG_EFI32_IH: u32 = 19;
const TAG_EFI64_IH: u32 = 20;

/// Parse failure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    NullPointer,
    Misaligned,
    BadMagic,
    /// total_size below the fixed header, or a tag running past the end
    Truncated,
    /// a tag with size < 8
    BadTagSize,
}

/// Parse the information structure the bootloader handed to the entry
/// point.
///
/// # Safety
///
/// `ptr` must point to a valid Multiboot2 information structure that
/// outlives the returned `BootInfo` and is not modified meanwhile.
pub unsafe fn parse<'a>(magic: u32, ptr: *const u8) -> Result<BootInfo<'a>, ParseError> {
    if magic != BOOTLOADER_MAGIC {
        return Err(ParseError::BadMagic);
    }
    if ptr.is_null() {
        return Err(ParseError::NullPointer);
    }
    if (ptr as usize) % TAG_ALIGN != 0 {
        return Err(ParseError::Misaligned);
    }

    let total_size = u32::from_le_bytes([*ptr, *ptr.add(1), *ptr.add(2), *ptr.add(3)]) as usize;
    if total_size < 8 {
        return Err(ParseError::Truncated);
    }

    let bytes = core::slice::from_raw_parts(ptr, total_size);
    parse_bytes(bytes)
}

/// Parse from an in-memory byte image. This is the testable core; the
/// slice must start at the `(total_size, reserved)` header.
pub fn parse_bytes(bytes: &[u8]) -> Result<BootInfo<'_>, ParseError> {
    if bytes.len() < 8 {
        return Err(ParseError::Truncated);
    }
    let total_size = read_u32(bytes, 0) as usize;
    if total_size < 8 || total_size > bytes.len() {
        return Err(ParseError::Truncated);
    }

    let mut info = BootInfo::empty();
    let mut saw_efi32 = false;
    let mut saw_efi64 = false;
    let mut efi32_ih: Option<u64> = None;
    let mut efi64_ih: Option<u64> = None;

    let mut offset = 8usize;
    while offset + 8 <= total_size {
        let tag_type = read_u32(bytes, offset);
        let tag_size = read_u32(bytes, offset + 4) as usize;
        if tag_size < 8 {
            return Err(ParseError::BadTagSize);
        }
        if offset + tag_size > total_size {
            return Err(ParseError::Truncated);
        }
        let payload = &bytes[offset + 8..offset + tag_size];

        match tag_type {
            TAG_END => break,
            TAG_CMDLINE => info.cmdline = parse_cstr(payload),
            TAG_BOOT_LOADER_NAME => info.bootloader_name = parse_cstr(payload),
            TAG_MODULE => parse_module(payload, &mut info),
            TAG_BASIC_MEMINFO => {
                if payload.len() >= 8 {
                    info.basic_mem = Some((read_u32(payload, 0), read_u32(payload, 4)));
                }
            }
            TAG_MMAP => parse_mmap(payload, &mut info),
            TAG_FRAMEBUFFER => info.framebuffer = parse_framebuffer(payload),
            TAG_EFI32 => {
                saw_efi32 = true;
                if payload.len() >= 4 {
                    info.efi_system_table = Some(read_u32(payload, 0) as u64);
                }
            }
            TAG_EFI64 => {
                saw_efi64 = true;
                if payload.len() >= 8 {
                    info.efi_system_table = Some(read_u64(payload, 0));
                }
            }
            TAG_EFI_BS => info.efi_boot_services = true,
            TAG_EFI32_IH => {
                if payload.len() >= 4 {
                    efi32_ih = Some(read_u32(payload, 0) as u64);
                }
            }
            TAG_EFI64_IH => {
                if payload.len() >= 8 {
                    efi64_ih = Some(read_u64(payload, 0));
                }
            }
            _ => {} // unknown tags are ignored
        }

        offset += align_up(tag_size, TAG_ALIGN);
    }

    // EFI64 wins over EFI32 wins over BIOS.
    info.boot_mode = if saw_efi64 {
        BootMode::Efi64
    } else if saw_efi32 {
        BootMode::Efi32
    } else {
        BootMode::Bios
    };
    info.efi_image_handle = if saw_efi64 { efi64_ih } else { efi32_ih };

    Ok(info)
}

fn parse_module(payload: &[u8], info: &mut BootInfo<'_>) {
    if payload.len() < 8 {
        return;
    }
    let module = BootModule {
        start: read_u32(payload, 0) as u64,
        end: read_u32(payload, 4) as u64,
    };
    if info.modules.push(module).is_err() {
        crate::warn!("multiboot2: module table full, dropping entry");
    }
}

fn parse_mmap(payload: &[u8], info: &mut BootInfo<'_>) {
    if payload.len() < 8 {
        return;
    }
    let entry_size = read_u32(payload, 0) as usize;
    // entry_version at +4 is ignored; entries only ever grow compatibly.
    if entry_size < 24 {
        return;
    }
    let mut pos = 8usize;
    while pos + entry_size <= payload.len() {
        let region = MemoryRegion {
            base: read_u64(payload, pos),
            length: read_u64(payload, pos + 8),
            kind: MemoryRegionKind::from_raw(read_u32(payload, pos + 16)),
        };
        if info.memory_map.push(region).is_err() {
            crate::warn!("multiboot2: memory map full, dropping entry");
            break;
        }
        pos += entry_size;
    }
}

fn parse_framebuffer(payload: &[u8]) -> Option<FramebufferInfo> {
    if payload.len() < 22 {
        return None;
    }
    let fb_type = payload[20];
    let kind = match fb_type {
        0 => FramebufferKind::Indexed,
        1 => FramebufferKind::Rgb,
        2 => FramebufferKind::Text,
        other => FramebufferKind::Unknown(other),
    };
    let mut rgb = RgbFields::default();
    if kind == FramebufferKind::Rgb && payload.len() >= 30 {
        // color_info for direct RGB: 6 bytes of field positions/sizes,
        // preceded by 2 reserved bytes after bpp/type.
        rgb = RgbFields {
            red_pos: payload[24],
            red_size: payload[25],
            green_pos: payload[26],
            green_size: payload[27],
            blue_pos: payload[28],
            blue_size: payload[29],
        };
    }
    Some(FramebufferInfo {
        addr: read_u64(payload, 0),
        pitch: read_u32(payload, 8),
        width: read_u32(payload, 12),
        height: read_u32(payload, 16),
        bpp: payload[21],
        kind,
        rgb,
    })
}

fn parse_cstr(payload: &[u8]) -> Option<&str> {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    core::str::from_utf8(&payload[..end]).ok()
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a synthetic Multiboot2 info image.
    struct InfoBuilder {
        bytes: Vec<u8>,
    }

    impl InfoBuilder {
        fn new() -> Self {
            // header placeholder: total_size patched in finish()
            Self { bytes: vec![0u8; 8] }
        }

        fn tag(mut self, tag_type: u32, payload: &[u8]) -> Self {
            let size = 8 + payload.len() as u32;
            self.bytes.extend_from_slice(&tag_type.to_le_bytes());
            self.bytes.extend_from_slice(&size.to_le_bytes());
            self.bytes.extend_from_slice(payload);
            while self.bytes.len() % 8 != 0 {
                self.bytes.push(0);
            }
            self
        }

        fn finish(mut self) -> Vec<u8> {
            self = self.tag(TAG_END, &[]);
            let total = self.bytes.len() as u32;
            self.bytes[0..4].copy_from_slice(&total.to_le_bytes());
            self.bytes
        }
    }

    fn mmap_payload(entries: &[(u64, u64, u32)]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&24u32.to_le_bytes()); // entry_size
        payload.extend_from_slice(&0u32.to_le_bytes()); // entry_version
        for &(base, len, kind) in entries {
            payload.extend_from_slice(&base.to_le_bytes());
            payload.extend_from_slice(&len.to_le_bytes());
            payload.extend_from_slice(&kind.to_le_bytes());
            payload.extend_from_slice(&0u32.to_le_bytes());
        }
        payload
    }

    #[test]
    fn test_memory_map_parsing() {
        let image = InfoBuilder::new()
            .tag(
                TAG_MMAP,
                &mmap_payload(&[
                    (0x0, 0x9FC00, 1),
                    (0x100000, 0x7F00000, 1),
                    (0xFFFC0000, 0x40000, 2),
                ]),
            )
            .finish();

        let info = parse_bytes(&image).unwrap();
        assert_eq!(info.boot_mode, BootMode::Bios);
        assert_eq!(info.memory_map.len(), 3);
        assert_eq!(info.memory_map[1].base, 0x100000);
        assert_eq!(info.memory_map[1].length, 0x7F00000);
        assert!(info.memory_map[1].kind.is_usable());
        assert_eq!(info.memory_map[2].kind, MemoryRegionKind::Reserved);
        assert_eq!(info.available_bytes(), 0x9FC00 + 0x7F00000);
    }

    #[test]
    fn test_boot_mode_prefers_efi64() {
        let image = InfoBuilder::new()
            .tag(TAG_EFI32, &0x1000u32.to_le_bytes())
            .tag(TAG_EFI64, &0x2000u64.to_le_bytes())
            .tag(TAG_EFI_BS, &[])
            .finish();

        let info = parse_bytes(&image).unwrap();
        assert_eq!(info.boot_mode, BootMode::Efi64);
        assert_eq!(info.efi_system_table, Some(0x2000));
        assert!(info.efi_boot_services);
    }

    #[test]
    fn test_efi32_without_efi64() {
        let image = InfoBuilder::new()
            .tag(TAG_EFI32, &0x1234u32.to_le_bytes())
            .finish();
        let info = parse_bytes(&image).unwrap();
        assert_eq!(info.boot_mode, BootMode::Efi32);
        assert_eq!(info.efi_system_table, Some(0x1234));
    }

    #[test]
    fn test_cmdline_and_loader_name() {
        let image = InfoBuilder::new()
            .tag(TAG_CMDLINE, b"loglevel=debug\0")
            .tag(TAG_BOOT_LOADER_NAME, b"GRUB 2.12\0")
            .finish();
        let info = parse_bytes(&image).unwrap();
        assert_eq!(info.cmdline, Some("loglevel=debug"));
        assert_eq!(info.bootloader_name, Some("GRUB 2.12"));
    }

    #[test]
    fn test_unknown_tags_are_skipped() {
        let image = InfoBuilder::new()
            .tag(0xDEAD, &[1, 2, 3, 4, 5])
            .tag(TAG_BASIC_MEMINFO, &{
                let mut p = Vec::new();
                p.extend_from_slice(&639u32.to_le_bytes());
                p.extend_from_slice(&130048u32.to_le_bytes());
                p
            })
            .finish();
        let info = parse_bytes(&image).unwrap();
        assert_eq!(info.basic_mem, Some((639, 130048)));
    }

    #[test]
    fn test_framebuffer_tag() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0xFD000000u64.to_le_bytes()); // addr
        payload.extend_from_slice(&4096u32.to_le_bytes()); // pitch
        payload.extend_from_slice(&1024u32.to_le_bytes()); // width
        payload.extend_from_slice(&768u32.to_le_bytes()); // height
        payload.push(32); // bpp
        payload.push(1); // type: RGB
        payload.extend_from_slice(&[0, 0]); // reserved
        payload.extend_from_slice(&[16, 8, 8, 8, 0, 8]); // rgb fields

        let image = InfoBuilder::new().tag(TAG_FRAMEBUFFER, &payload).finish();
        let info = parse_bytes(&image).unwrap();
        let fb = info.framebuffer.unwrap();
        assert_eq!(fb.addr, 0xFD000000);
        assert_eq!(fb.pitch, 4096);
        assert_eq!((fb.width, fb.height, fb.bpp), (1024, 768, 32));
        assert_eq!(fb.kind, FramebufferKind::Rgb);
        assert_eq!(fb.rgb.red_pos, 16);
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let mut image = InfoBuilder::new()
            .tag(TAG_MMAP, &mmap_payload(&[(0, 4096, 1)]))
            .finish();
        // Claim a larger total_size than the buffer holds.
        let bogus = (image.len() as u32 + 64).to_le_bytes();
        image[0..4].copy_from_slice(&bogus);
        assert!(matches!(parse_bytes(&image), Err(ParseError::Truncated)));
    }

    #[test]
    fn test_modules_collected() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0x800000u32.to_le_bytes());
        payload.extend_from_slice(&0x810000u32.to_le_bytes());
        payload.extend_from_slice(b"initrd\0");
        let image = InfoBuilder::new().tag(TAG_MODULE, &payload).finish();
        let info = parse_bytes(&image).unwrap();
        assert_eq!(info.modules.len(), 1);
        assert_eq!(info.modules[0].start, 0x800000);
        assert_eq!(info.modules[0].end, 0x810000);
    }
}
