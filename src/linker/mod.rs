// The linker interface the emitter and the boot-header writer talk to, and its ELF
// implementation over the object crate. Symbols allocate byte regions inside one of the four
// canonical sections; link requests record fixups against those regions. Section layout is
// deterministic: sections are laid out in text/rodata/data/bss order from the base address
// at the configured alignment, so symbol virtual addresses are queryable before the object
// bytes are built. The produced object is relocatable ELF; link requests become ELF
// relocations resolved by the downstream image writer.

pub mod multiboot;

use std::collections::HashMap;

use object::write::{Object, Relocation, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SymbolFlags, SymbolKind, SymbolScope,
};

use crate::core::error::{CompileError, CompileResult};

/// Canonical output sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Text,
    ROData,
    Data,
    Bss,
}

impl SectionKind {
    pub const ALL: [SectionKind; 4] = [
        SectionKind::Text,
        SectionKind::ROData,
        SectionKind::Data,
        SectionKind::Bss,
    ];

    fn name(self) -> &'static str {
        match self {
            SectionKind::Text => ".text",
            SectionKind::ROData => ".rodata",
            SectionKind::Data => ".data",
            SectionKind::Bss => ".bss",
        }
    }

    fn object_kind(self) -> object::SectionKind {
        match self {
            SectionKind::Text => object::SectionKind::Text,
            SectionKind::ROData => object::SectionKind::ReadOnlyData,
            SectionKind::Data => object::SectionKind::Data,
            SectionKind::Bss => object::SectionKind::UninitializedData,
        }
    }
}

/// How a fixup is patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// 32-bit PC-relative.
    Relative32,
    /// Absolute pointer-wide address.
    Absolute,
}

/// A recorded fixup.
#[derive(Debug, Clone)]
pub struct LinkRequest {
    pub kind: LinkKind,
    pub in_symbol: String,
    /// Offset of the hole within the containing symbol.
    pub offset: u64,
    pub target: String,
    pub addend: i64,
}

/// Where a symbol landed.
#[derive(Debug, Clone)]
pub struct SymbolRecord {
    pub section: SectionKind,
    /// Offset of the symbol within its section.
    pub section_offset: u64,
    pub size: u64,
}

/// Symbol, section and relocation sink consumed by the code emitter.
pub trait Linker {
    /// Reserve `size` bytes for a symbol and return the writable region.
    fn allocate(
        &mut self,
        name: &str,
        section: SectionKind,
        size: usize,
        align: u32,
    ) -> CompileResult<&mut [u8]>;

    /// Patch bytes inside an already-allocated symbol.
    fn write_symbol(&mut self, name: &str, offset: usize, bytes: &[u8]) -> CompileResult<()>;

    /// Record a fixup inside an allocated symbol.
    fn link(
        &mut self,
        kind: LinkKind,
        in_symbol: &str,
        offset: u64,
        target: &str,
        addend: i64,
    ) -> CompileResult<()>;

    fn get_symbol(&self, name: &str) -> Option<&SymbolRecord>;

    fn base_address(&self) -> u64;

    fn section_virtual_address(&self, section: SectionKind) -> u64;

    /// Virtual address of a symbol under the deterministic layout.
    fn symbol_virtual_address(&self, name: &str) -> Option<u64> {
        let record = self.get_symbol(name)?;
        Some(self.section_virtual_address(record.section) + record.section_offset)
    }

    fn load_section_alignment(&self) -> u64;

    fn virtual_section_alignment(&self) -> u64;

    /// Whether the output container is ELF.
    fn emits_elf(&self) -> bool;
}

struct SectionBuffer {
    data: Vec<u8>,
    /// Bss tracks size only; data stays empty.
    bss_size: u64,
}

/// ELF object writer backed by the `object` crate. The same allocator also
/// serves the boot-image path, where the container is a flat image written
/// downstream and `emits_elf` reports false.
pub struct ObjectFileLinker {
    elf64: bool,
    elf_container: bool,
    base: u64,
    load_align: u64,
    virtual_align: u64,
    sections: HashMap<SectionKind, SectionBuffer>,
    symbols: HashMap<String, SymbolRecord>,
    /// Allocation order, for stable object emission.
    symbol_order: Vec<String>,
    links: Vec<LinkRequest>,
}

impl ObjectFileLinker {
    pub fn new(elf64: bool, base: u64) -> Self {
        let mut sections = HashMap::new();
        for kind in SectionKind::ALL {
            sections.insert(
                kind,
                SectionBuffer {
                    data: Vec::new(),
                    bss_size: 0,
                },
            );
        }
        Self {
            elf64,
            elf_container: true,
            base,
            load_align: 0x1000,
            virtual_align: 0x1000,
            sections,
            symbols: HashMap::new(),
            symbol_order: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Target a flat boot image instead of ELF; the multiboot header writer
    /// only engages on this path.
    pub fn with_flat_container(mut self) -> Self {
        self.elf_container = false;
        self
    }

    pub fn with_alignments(mut self, load: u64, virtual_: u64) -> Self {
        self.load_align = load;
        self.virtual_align = virtual_;
        self
    }

    fn section_size(&self, kind: SectionKind) -> u64 {
        let buffer = &self.sections[&kind];
        if kind == SectionKind::Bss {
            buffer.bss_size
        } else {
            buffer.data.len() as u64
        }
    }

    pub fn links(&self) -> &[LinkRequest] {
        &self.links
    }

    /// Bytes currently allocated to a symbol.
    pub fn symbol_bytes(&self, name: &str) -> Option<&[u8]> {
        let record = self.symbols.get(name)?;
        if record.section == SectionKind::Bss {
            return None;
        }
        let buffer = &self.sections[&record.section];
        let start = record.section_offset as usize;
        buffer.data.get(start..start + record.size as usize)
    }

    /// Build the relocatable ELF object.
    pub fn build_object(&self) -> CompileResult<Vec<u8>> {
        let architecture = if self.elf64 {
            Architecture::X86_64
        } else {
            Architecture::I386
        };
        let mut object = Object::new(BinaryFormat::Elf, architecture, Endianness::Little);

        let mut section_ids = HashMap::new();
        for kind in SectionKind::ALL {
            let id = object.add_section(Vec::new(), kind.name().as_bytes().to_vec(), kind.object_kind());
            if kind == SectionKind::Bss {
                object
                    .section_mut(id)
                    .append_bss(self.section_size(kind), self.virtual_align);
            } else {
                let buffer = &self.sections[&kind];
                object
                    .section_mut(id)
                    .set_data(buffer.data.clone(), self.virtual_align);
            }
            section_ids.insert(kind, id);
        }

        let mut symbol_ids = HashMap::new();
        for name in &self.symbol_order {
            let record = &self.symbols[name];
            let id = object.add_symbol(Symbol {
                name: name.as_bytes().to_vec(),
                value: record.section_offset,
                size: record.size,
                kind: if record.section == SectionKind::Text {
                    SymbolKind::Text
                } else {
                    SymbolKind::Data
                },
                scope: SymbolScope::Linkage,
                weak: false,
                section: SymbolSection::Section(section_ids[&record.section]),
                flags: SymbolFlags::None,
            });
            symbol_ids.insert(name.clone(), id);
        }

        for link in &self.links {
            let Some(container) = self.symbols.get(&link.in_symbol) else {
                return Err(CompileError::Linker {
                    reason: format!("link request inside unknown symbol {}", link.in_symbol),
                });
            };
            let target_id = match symbol_ids.get(&link.target) {
                Some(id) => *id,
                None => {
                    // External reference.
                    let id = object.add_symbol(Symbol {
                        name: link.target.as_bytes().to_vec(),
                        value: 0,
                        size: 0,
                        kind: SymbolKind::Unknown,
                        scope: SymbolScope::Unknown,
                        weak: false,
                        section: SymbolSection::Undefined,
                        flags: SymbolFlags::None,
                    });
                    id
                }
            };
            let (kind, size) = match link.kind {
                LinkKind::Relative32 => (RelocationKind::Relative, 32),
                LinkKind::Absolute => {
                    (RelocationKind::Absolute, if self.elf64 { 64 } else { 32 })
                }
            };
            object
                .add_relocation(
                    section_ids[&container.section],
                    Relocation {
                        offset: container.section_offset + link.offset,
                        symbol: target_id,
                        addend: link.addend,
                        flags: RelocationFlags::Generic {
                            kind,
                            encoding: RelocationEncoding::Generic,
                            size,
                        },
                    },
                )
                .map_err(|e| CompileError::Linker {
                    reason: e.to_string(),
                })?;
        }

        object.write().map_err(|e| CompileError::Linker {
            reason: e.to_string(),
        })
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    if align == 0 {
        return value;
    }
    value.div_ceil(align) * align
}

impl Linker for ObjectFileLinker {
    fn allocate(
        &mut self,
        name: &str,
        section: SectionKind,
        size: usize,
        align: u32,
    ) -> CompileResult<&mut [u8]> {
        if self.symbols.contains_key(name) {
            return Err(CompileError::Linker {
                reason: format!("symbol {name} allocated twice"),
            });
        }
        let buffer = self.sections.get_mut(&section).expect("canonical section");
        if section == SectionKind::Bss {
            let offset = align_up(buffer.bss_size, align as u64);
            buffer.bss_size = offset + size as u64;
            self.symbols.insert(
                name.to_string(),
                SymbolRecord {
                    section,
                    section_offset: offset,
                    size: size as u64,
                },
            );
            self.symbol_order.push(name.to_string());
            // Bss has no bytes to hand out; callers only place symbols there.
            return Ok(&mut []);
        }
        let offset = align_up(buffer.data.len() as u64, align as u64) as usize;
        buffer.data.resize(offset + size, 0);
        self.symbols.insert(
            name.to_string(),
            SymbolRecord {
                section,
                section_offset: offset as u64,
                size: size as u64,
            },
        );
        self.symbol_order.push(name.to_string());
        Ok(&mut buffer.data[offset..offset + size])
    }

    fn write_symbol(&mut self, name: &str, offset: usize, bytes: &[u8]) -> CompileResult<()> {
        let Some(record) = self.symbols.get(name) else {
            return Err(CompileError::Linker {
                reason: format!("write into unallocated symbol {name}"),
            });
        };
        if record.section == SectionKind::Bss
            || offset + bytes.len() > record.size as usize
        {
            return Err(CompileError::Linker {
                reason: format!("write outside symbol {name}"),
            });
        }
        let start = record.section_offset as usize + offset;
        let section = record.section;
        let buffer = self.sections.get_mut(&section).expect("canonical section");
        buffer.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn link(
        &mut self,
        kind: LinkKind,
        in_symbol: &str,
        offset: u64,
        target: &str,
        addend: i64,
    ) -> CompileResult<()> {
        if !self.symbols.contains_key(in_symbol) {
            return Err(CompileError::Linker {
                reason: format!("link request inside unallocated symbol {in_symbol}"),
            });
        }
        self.links.push(LinkRequest {
            kind,
            in_symbol: in_symbol.to_string(),
            offset,
            target: target.to_string(),
            addend,
        });
        Ok(())
    }

    fn get_symbol(&self, name: &str) -> Option<&SymbolRecord> {
        self.symbols.get(name)
    }

    fn base_address(&self) -> u64 {
        self.base
    }

    fn section_virtual_address(&self, section: SectionKind) -> u64 {
        // Deterministic layout in canonical order from the base address.
        let mut address = self.base;
        for kind in SectionKind::ALL {
            address = align_up(address, self.virtual_align);
            if kind == section {
                return address;
            }
            address += self.section_size(kind);
        }
        unreachable!("canonical section")
    }

    fn load_section_alignment(&self) -> u64 {
        self.load_align
    }

    fn virtual_section_alignment(&self) -> u64 {
        self.virtual_align
    }

    fn emits_elf(&self) -> bool {
        self.elf_container
    }
}
