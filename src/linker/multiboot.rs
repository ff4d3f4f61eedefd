//! Multiboot 0.6.95 header writer.
//!
//! Non-ELF images need the fixed header within the first 8 KiB so a
//! compliant boot loader can find the load addresses and entry point. The
//! header requests memory info and page-aligned modules; the entry-point
//! field is a relocation rather than a precomputed constant, and the fields
//! past it stay zero because the flags request no video mode. This writer
//! runs after all other allocations, when section layout is final.

use crate::core::error::{CompileError, CompileResult};
use crate::linker::{LinkKind, Linker, SectionKind};

pub const MULTIBOOT_HEADER_SYMBOL: &str = "<$>mosa-multiboot-header";

const MAGIC: u32 = 0x1BAD_B002;
/// Memory info plus page-aligned modules.
const FLAGS: u32 = 0x0000_0003;
const HEADER_SIZE: usize = 64;

/// Write the header into `.text` and request the entry-point relocation.
/// ELF images carry their own load headers and skip this.
pub fn write_multiboot_header(linker: &mut dyn Linker, entry_symbol: &str) -> CompileResult<()> {
    if linker.emits_elf() {
        return Ok(());
    }
    if linker.load_section_alignment() != linker.virtual_section_alignment() {
        return Err(CompileError::Linker {
            reason: format!(
                "multiboot image requires matching load and virtual alignment ({} != {})",
                linker.load_section_alignment(),
                linker.virtual_section_alignment()
            ),
        });
    }

    linker.allocate(MULTIBOOT_HEADER_SYMBOL, SectionKind::Text, HEADER_SIZE, 4)?;

    let header_addr = linker
        .symbol_virtual_address(MULTIBOOT_HEADER_SYMBOL)
        .ok_or_else(|| CompileError::Linker {
            reason: "multiboot header did not allocate".to_string(),
        })? as u32;
    let load_addr = linker.base_address() as u32;
    let checksum = 0u32.wrapping_sub(MAGIC.wrapping_add(FLAGS));

    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&FLAGS.to_le_bytes());
    header[8..12].copy_from_slice(&checksum.to_le_bytes());
    header[12..16].copy_from_slice(&header_addr.to_le_bytes());
    header[16..20].copy_from_slice(&load_addr.to_le_bytes());
    // load_end_addr and bss_end_addr stay zero: load the whole image.
    linker.write_symbol(MULTIBOOT_HEADER_SYMBOL, 0, &header)?;

    // The entry point is resolved by the linker, not precomputed.
    linker.link(
        LinkKind::Absolute,
        MULTIBOOT_HEADER_SYMBOL,
        28,
        entry_symbol,
        0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linker::ObjectFileLinker;

    #[test]
    fn header_bytes_match_the_boot_protocol() {
        let mut linker = ObjectFileLinker::new(false, 0x10_0000).with_flat_container();
        write_multiboot_header(&mut linker, "Kernel::Start").unwrap();

        let bytes = linker.symbol_bytes(MULTIBOOT_HEADER_SYMBOL).unwrap();
        assert_eq!(bytes.len(), 64);
        assert_eq!(&bytes[0..4], &0x1BAD_B002u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0x0000_0003u32.to_le_bytes());
        let checksum = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        assert_eq!(
            checksum.wrapping_add(0x1BAD_B002).wrapping_add(0x3),
            0,
            "checksum must cancel magic and flags"
        );
        // The header is the first text allocation, so its address is the
        // base address, which is also the load address.
        assert_eq!(&bytes[12..16], &0x10_0000u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &0x10_0000u32.to_le_bytes());
        assert_eq!(&bytes[20..28], &[0u8; 8]);

        // Entry point lands as a relocation at offset 28.
        let link = &linker.links()[0];
        assert_eq!(link.in_symbol, MULTIBOOT_HEADER_SYMBOL);
        assert_eq!(link.offset, 28);
        assert_eq!(link.target, "Kernel::Start");
        assert_eq!(link.kind, LinkKind::Absolute);
    }

    #[test]
    fn elf_images_skip_the_header() {
        let mut linker = ObjectFileLinker::new(true, 0);
        write_multiboot_header(&mut linker, "Kernel::Start").unwrap();
        assert!(linker.get_symbol(MULTIBOOT_HEADER_SYMBOL).is_none());
    }

    #[test]
    fn alignment_mismatch_is_a_linker_error() {
        let mut linker = ObjectFileLinker::new(false, 0)
            .with_flat_container()
            .with_alignments(0x1000, 0x200000);
        let err = write_multiboot_header(&mut linker, "Kernel::Start").unwrap_err();
        assert!(matches!(err, CompileError::Linker { .. }));
    }
}
