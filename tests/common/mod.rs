//! Shared test support: a minimal instruction assembler and an in-memory
//! relocatable-image builder shaped like the objects clang emits for BPF
//! targets.

#![allow(dead_code)]

use bpfvm::ebpf::{self, Insn};
use bpfvm::elf;
use bpfvm::pod::bytes_of;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn insn(opcode: u8, dst: u8, src: u8, offset: i16, imm: i32) -> Insn {
    Insn {
        opcode,
        dst,
        src,
        offset,
        imm,
    }
}

pub fn mov64_imm(dst: u8, imm: i32) -> Insn {
    insn(ebpf::MOV64_IMM, dst, 0, 0, imm)
}

pub fn mov64_reg(dst: u8, src: u8) -> Insn {
    insn(ebpf::MOV64_REG, dst, src, 0, 0)
}

pub fn call_helper(index: i32) -> Insn {
    insn(ebpf::CALL, 0, 0, 0, index)
}

pub fn call_local(imm: i32) -> Insn {
    insn(ebpf::CALL, 0, 1, 0, imm)
}

pub fn exit() -> Insn {
    insn(ebpf::EXIT, 0, 0, 0, 0)
}

/// The two records of a 64-bit immediate load.
pub fn lddw(dst: u8, value: u64) -> [Insn; 2] {
    [
        insn(ebpf::LDDW, dst, 0, 0, value as u32 as i32),
        insn(0, 0, 0, 0, (value >> 32) as u32 as i32),
    ]
}

pub fn asm(insns: &[Insn]) -> Vec<u8> {
    insns.iter().flat_map(|insn| insn.write()).collect()
}

/// Pack the low byte of each argument, big-endian.
pub fn gather_bytes(a: u64, b: u64, c: u64, d: u64, e: u64) -> u64 {
    ((a & 0xff) << 32) | ((b & 0xff) << 24) | ((c & 0xff) << 16) | ((d & 0xff) << 8) | (e & 0xff)
}

struct SectionSpec {
    name: &'static str,
    sh_type: u32,
    sh_flags: u64,
    data: Vec<u8>,
}

struct SymbolSpec {
    name: &'static str,
    info: u8,
    shndx: u16,
    value: u64,
    size: u64,
}

struct RelSpec {
    target: u32,
    entries: Vec<(u64, u32, u32)>,
}

/// Builds a 64-bit little-endian relocatable image in memory.
///
/// One string table serves section and symbol names, matching what the
/// loader consumes. Section indices returned by the `add_*` methods are
/// final; the symbol table, string table, and relocation sections are
/// appended at build time.
pub struct ImageBuilder {
    machine: u16,
    sections: Vec<SectionSpec>,
    symbols: Vec<SymbolSpec>,
    relocations: Vec<RelSpec>,
}

impl ImageBuilder {
    pub fn new() -> ImageBuilder {
        ImageBuilder {
            machine: elf::EM_BPF,
            sections: vec![SectionSpec {
                name: "",
                sh_type: 0,
                sh_flags: 0,
                data: Vec::new(),
            }],
            symbols: Vec::new(),
            relocations: Vec::new(),
        }
    }

    pub fn machine(&mut self, machine: u16) -> &mut Self {
        self.machine = machine;
        self
    }

    pub fn add_section(
        &mut self,
        name: &'static str,
        sh_type: u32,
        sh_flags: u64,
        data: Vec<u8>,
    ) -> u16 {
        self.sections.push(SectionSpec {
            name,
            sh_type,
            sh_flags,
            data,
        });
        (self.sections.len() - 1) as u16
    }

    pub fn add_code(&mut self, name: &'static str, data: Vec<u8>) -> u16 {
        self.add_section(
            name,
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_EXECINSTR,
            data,
        )
    }

    pub fn add_data(&mut self, name: &'static str, data: Vec<u8>) -> u16 {
        self.add_section(name, elf::SHT_PROGBITS, elf::SHF_ALLOC | elf::SHF_WRITE, data)
    }

    fn add_symbol(&mut self, name: &'static str, info: u8, shndx: u16, value: u64, size: u64) -> u32 {
        self.symbols.push(SymbolSpec {
            name,
            info,
            shndx,
            value,
            size,
        });
        self.symbols.len() as u32
    }

    /// Add a function symbol; returns its symbol index for relocations.
    pub fn add_func(&mut self, name: &'static str, shndx: u16, value: u64, size: u64) -> u32 {
        // STT_FUNC with global binding.
        self.add_symbol(name, (1 << 4) | elf::STT_FUNC, shndx, value, size)
    }

    /// Add a data object symbol, e.g. a host-managed table.
    pub fn add_data_sym(&mut self, name: &'static str, shndx: u16, value: u64, size: u64) -> u32 {
        // STT_OBJECT with global binding.
        self.add_symbol(name, (1 << 4) | 1, shndx, value, size)
    }

    /// Add an undefined symbol, the shape clang gives helper references.
    pub fn add_undef_sym(&mut self, name: &'static str) -> u32 {
        self.add_symbol(name, 1 << 4, 0, 0, 0)
    }

    /// Add a relocation section applying to `target`. Entries are
    /// `(r_offset, symbol index, relocation type)`.
    pub fn add_rel(&mut self, target: u16, entries: Vec<(u64, u32, u32)>) {
        self.relocations.push(RelSpec {
            target: u32::from(target),
            entries,
        });
    }

    pub fn build(self) -> Vec<u8> {
        let mut strtab = vec![0u8];
        let add_string = |strtab: &mut Vec<u8>, name: &str| -> u32 {
            let offset = strtab.len() as u32;
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
            offset
        };

        // Symbol table: a null symbol, then every registered function.
        let mut symtab = Vec::new();
        symtab.extend_from_slice(bytes_of(&elf::Sym::default()));
        let mut symbol_names = Vec::new();
        for symbol in &self.symbols {
            symbol_names.push(add_string(&mut strtab, symbol.name));
        }
        for (symbol, &st_name) in self.symbols.iter().zip(&symbol_names) {
            let sym = elf::Sym {
                st_name: elf::U32::new(st_name),
                st_info: symbol.info,
                st_other: 0,
                st_shndx: elf::U16::new(symbol.shndx),
                st_value: elf::U64::new(symbol.value),
                st_size: elf::U64::new(symbol.size),
            };
            symtab.extend_from_slice(bytes_of(&sym));
        }

        // Assemble the full section list: user sections, symtab, strtab,
        // then one relocation section per registered batch.
        let mut sections = self.sections;
        let symtab_index = sections.len() as u32;
        sections.push(SectionSpec {
            name: ".symtab",
            sh_type: elf::SHT_SYMTAB,
            sh_flags: 0,
            data: symtab,
        });
        for relocation in &self.relocations {
            let mut data = Vec::new();
            for &(r_offset, sym, r_type) in &relocation.entries {
                let rel = elf::Rel {
                    r_offset: elf::U64::new(r_offset),
                    r_info: elf::U64::new(elf::Rel::r_info(sym, r_type)),
                };
                data.extend_from_slice(bytes_of(&rel));
            }
            sections.push(SectionSpec {
                name: ".rel",
                sh_type: elf::SHT_REL,
                sh_flags: 0,
                data,
            });
        }

        let mut name_offsets = Vec::new();
        for section in &sections {
            name_offsets.push(add_string(&mut strtab, section.name));
        }
        let strtab_index = sections.len() as u32;
        name_offsets.push(add_string(&mut strtab, ".strtab"));
        sections.push(SectionSpec {
            name: ".strtab",
            sh_type: elf::SHT_STRTAB,
            sh_flags: 0,
            data: strtab,
        });

        // Layout: file header, section headers, payloads.
        let shoff = 64u64;
        let shnum = sections.len() as u16;
        let mut offset = shoff + 64 * u64::from(shnum);

        let header = elf::FileHeader {
            e_ident: elf::Ident {
                magic: elf::ELFMAG,
                class: elf::ELFCLASS64,
                data: elf::ELFDATA2LSB,
                version: elf::EV_CURRENT,
                os_abi: elf::ELFOSABI_NONE,
                abi_version: 0,
                padding: [0; 7],
            },
            e_type: elf::U16::new(elf::ET_REL),
            e_machine: elf::U16::new(self.machine),
            e_version: elf::U32::new(1),
            e_entry: elf::U64::new(0),
            e_phoff: elf::U64::new(0),
            e_shoff: elf::U64::new(shoff),
            e_flags: elf::U32::new(0),
            e_ehsize: elf::U16::new(64),
            e_phentsize: elf::U16::new(0),
            e_phnum: elf::U16::new(0),
            e_shentsize: elf::U16::new(64),
            e_shnum: elf::U16::new(shnum),
            e_shstrndx: elf::U16::new(strtab_index as u16),
        };

        let mut image = Vec::new();
        image.extend_from_slice(bytes_of(&header));

        let rel_base = symtab_index as usize + 1;
        for (i, section) in sections.iter().enumerate() {
            let (sh_link, sh_info) = if section.sh_type == elf::SHT_REL {
                (symtab_index, self.relocations[i - rel_base].target)
            } else {
                (0, 0)
            };
            let shdr = elf::SectionHeader {
                sh_name: elf::U32::new(name_offsets[i]),
                sh_type: elf::U32::new(section.sh_type),
                sh_flags: elf::U64::new(section.sh_flags),
                sh_addr: elf::U64::new(0),
                sh_offset: elf::U64::new(if section.data.is_empty() { 0 } else { offset }),
                sh_size: elf::U64::new(section.data.len() as u64),
                sh_link: elf::U32::new(sh_link),
                sh_info: elf::U32::new(sh_info),
                sh_addralign: elf::U64::new(0),
                sh_entsize: elf::U64::new(0),
            };
            image.extend_from_slice(bytes_of(&shdr));
            offset += section.data.len() as u64;
        }
        for section in &sections {
            image.extend_from_slice(&section.data);
        }
        image
    }
}
