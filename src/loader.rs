//! Loading programs from relocatable object images.
//!
//! The loader accepts a 64-bit little-endian relocatable image, discovers
//! every function symbol in its executable sections, concatenates the
//! functions into one flat program with the main function first, applies
//! the two supported relocation kinds, and hands the linked program to the
//! plain loader (which runs the verifier).

use core::mem;
use core::str;

use crate::ebpf;
use crate::elf;
use crate::error::{Error, Result};
use crate::pod::Bytes;
use crate::vm::Vm;

/// Maximum number of sections accepted in an image.
const MAX_SECTIONS: usize = 32;

trait ReadError<T> {
    fn read_error(self, message: &'static str) -> Result<T>;
}

impl<T> ReadError<T> for core::result::Result<T, ()> {
    fn read_error(self, message: &'static str) -> Result<T> {
        self.map_err(|()| Error::MalformedImage(message.into()))
    }
}

impl<T> ReadError<T> for Option<T> {
    fn read_error(self, message: &'static str) -> Result<T> {
        self.ok_or_else(|| Error::MalformedImage(message.into()))
    }
}

/// A string table section.
#[derive(Debug, Default, Clone, Copy)]
struct StringTable<'data> {
    data: &'data [u8],
}

impl<'data> StringTable<'data> {
    /// Get the null-terminated string at the given offset.
    fn get(&self, offset: u32) -> Option<&'data str> {
        let data = self.data.get(offset as usize..)?;
        let end = memchr::memchr(0, data)?;
        str::from_utf8(&data[..end]).ok()
    }
}

/// A section header together with its payload.
struct Section<'data> {
    header: &'data elf::SectionHeader,
    data: Bytes<'data>,
}

impl<'data> Section<'data> {
    fn is_executable(&self) -> bool {
        self.header.sh_type.get() == elf::SHT_PROGBITS
            && self.header.sh_flags.get() == elf::SHF_ALLOC | elf::SHF_EXECINSTR
    }

    fn is_writable_data(&self) -> bool {
        self.header.sh_type.get() == elf::SHT_PROGBITS
            && self.header.sh_flags.get() == elf::SHF_ALLOC | elf::SHF_WRITE
    }
}

/// A function symbol placed into the linked program.
struct Function<'data> {
    name: &'data str,
    /// Index of the section the function came from.
    section: usize,
    /// Byte offset of the function within its section.
    section_start: u64,
    /// Byte size of the function.
    size: u64,
    /// Byte offset of the function within the linked program.
    linked_offset: usize,
    /// Instruction offset of the function within the linked program.
    insn_offset: usize,
}

/// Load a program from a relocatable object image.
///
/// `main` selects the entry function by name; with `None` the symbol at
/// offset 0 of the section named `.text` is the entry.
pub(crate) fn load_object(vm: &mut Vm, image: &[u8], main: Option<&str>) -> Result<()> {
    if vm.is_loaded() {
        return Err(Error::AlreadyLoaded);
    }
    let linked = link(vm, image, main)?;
    vm.load_inner(&linked)
}

fn link(vm: &Vm, image: &[u8], main: Option<&str>) -> Result<Vec<u8>> {
    let data = Bytes(image);
    let header = data
        .read_at::<elf::FileHeader>(0)
        .read_error("not enough data for the file header")?;
    check_header(header)?;

    let sections = read_sections(data, header)?;

    let strings = sections
        .iter()
        .find(|section| section.header.sh_type.get() == elf::SHT_STRTAB)
        .map(|section| StringTable {
            data: section.data.0,
        })
        .read_error("could not find the string table in the image")?;

    let symbols = sections
        .iter()
        .find(|section| section.header.sh_type.get() == elf::SHT_SYMTAB)
        .map(|section| read_symbols(section))
        .read_error("could not find the symbol table in the image")??;

    let (functions, linked_size) = discover_functions(&sections, strings, symbols, main)?;
    log::debug!(
        "linking {} function(s), {} bytes of code",
        functions.len(),
        linked_size
    );

    let mut linked = vec![0u8; linked_size];
    for function in &functions {
        let code = function_bytes(&sections, function)?;
        linked[function.linked_offset..function.linked_offset + function.size as usize]
            .copy_from_slice(code);
    }

    apply_relocations(vm, &sections, strings, &functions, &mut linked)?;

    Ok(linked)
}

fn check_header(header: &elf::FileHeader) -> Result<()> {
    let unsupported = |message: &str| Err(Error::UnsupportedImage(message.into()));
    if header.e_ident.magic != elf::ELFMAG {
        return Err(Error::MalformedImage("wrong magic".into()));
    }
    if header.e_ident.class != elf::ELFCLASS64 {
        return unsupported("wrong class, expected 64-bit");
    }
    if header.e_ident.data != elf::ELFDATA2LSB {
        return unsupported("wrong byte order, expected little-endian");
    }
    if header.e_ident.version != elf::EV_CURRENT {
        return unsupported("wrong version");
    }
    if header.e_ident.os_abi != elf::ELFOSABI_NONE {
        return unsupported("wrong OS ABI");
    }
    if header.e_type.get() != elf::ET_REL {
        return unsupported("wrong type, expected relocatable");
    }
    let machine = header.e_machine.get();
    if machine != elf::EM_NONE && machine != elf::EM_BPF {
        return unsupported("wrong machine, expected none or BPF");
    }
    if header.e_shnum.get() as usize > MAX_SECTIONS {
        return Err(Error::MalformedImage("too many sections".into()));
    }
    if header.e_shentsize.get() as usize != mem::size_of::<elf::SectionHeader>() {
        return Err(Error::MalformedImage(
            "bad section header entry size".into(),
        ));
    }
    Ok(())
}

fn read_sections<'data>(
    data: Bytes<'data>,
    header: &elf::FileHeader,
) -> Result<Vec<Section<'data>>> {
    let headers = data
        .read_slice_at::<elf::SectionHeader>(
            header.e_shoff.get() as usize,
            header.e_shnum.get() as usize,
        )
        .read_error("bad section header offset or size")?;
    headers
        .iter()
        .map(|header| {
            let data = data
                .read_bytes_at(header.sh_offset.get() as usize, header.sh_size.get() as usize)
                .read_error("bad section offset or size")?;
            Ok(Section { header, data })
        })
        .collect()
}

fn read_symbols<'data>(section: &Section<'data>) -> Result<&'data [elf::Sym]> {
    let count = section.data.len() / mem::size_of::<elf::Sym>();
    section
        .data
        .read_slice_at::<elf::Sym>(0, count)
        .read_error("bad symbol table")
}

fn discover_functions<'data>(
    sections: &[Section<'data>],
    strings: StringTable<'data>,
    symbols: &'data [elf::Sym],
    main: Option<&str>,
) -> Result<(Vec<Function<'data>>, usize)> {
    let mut main_function: Option<Function<'data>> = None;
    let mut others: Vec<Function<'data>> = Vec::new();

    for sym in symbols {
        if sym.st_type() != elf::STT_FUNC {
            continue;
        }
        let name = strings
            .get(sym.st_name.get())
            .read_error("a function symbol contained a bad name")?;
        let shndx = sym.st_shndx.get() as usize;
        let section = sections
            .get(shndx)
            .read_error("a function symbol contained a bad section index")?;
        if !section.is_executable() {
            return Err(Error::MalformedImage(format!(
                "function symbol {} points to a non-executable section",
                name
            )));
        }
        if sym.st_size.get() % ebpf::INSN_SIZE as u64 != 0 {
            return Err(Error::MalformedImage(format!(
                "function symbol {} has a size that is not a multiple of 8",
                name
            )));
        }
        let end = sym.st_value.get().checked_add(sym.st_size.get());
        if end.map_or(true, |end| end > section.data.len() as u64) {
            return Err(Error::MalformedImage(format!(
                "function symbol {} contained bad bounds",
                name
            )));
        }
        let function = Function {
            name,
            section: shndx,
            section_start: sym.st_value.get(),
            size: sym.st_size.get(),
            linked_offset: 0,
            insn_offset: 0,
        };

        let section_name = strings.get(section.header.sh_name.get());
        let is_main = match main {
            Some(main) => name == main,
            // Without an explicit name, the function at the start of
            // .text is the entry.
            None => section_name == Some(".text") && function.section_start == 0,
        };
        if is_main {
            main_function = Some(function);
        } else {
            others.push(function);
        }
    }

    let main_function = main_function
        .ok_or_else(|| Error::MissingEntry(main.unwrap_or("main").to_owned()))?;

    let mut functions = Vec::with_capacity(1 + others.len());
    functions.push(main_function);
    functions.extend(others);

    let mut offset = 0usize;
    for function in &mut functions {
        function.linked_offset = offset;
        function.insn_offset = offset / ebpf::INSN_SIZE;
        offset += function.size as usize;
        log::debug!(
            "function {} at insn offset {} ({} bytes)",
            function.name,
            function.insn_offset,
            function.size
        );
    }
    Ok((functions, offset))
}

fn function_bytes<'data>(
    sections: &[Section<'data>],
    function: &Function<'data>,
) -> Result<&'data [u8]> {
    sections[function.section]
        .data
        .read_bytes_at(function.section_start as usize, function.size as usize)
        .read_error("a function symbol contained bad bounds")
        .map(|bytes| bytes.0)
}

fn apply_relocations(
    vm: &Vm,
    sections: &[Section<'_>],
    strings: StringTable<'_>,
    functions: &[Function<'_>],
    linked: &mut [u8],
) -> Result<()> {
    for section in sections {
        if section.header.sh_type.get() != elf::SHT_REL {
            continue;
        }
        // sh_info names the section these relocations apply to. Only
        // relocations against executable sections are consumed.
        let applies_to = section.header.sh_info.get() as usize;
        let target_section = sections
            .get(applies_to)
            .read_error("bad relocation target section index")?;
        if !target_section.is_executable() {
            continue;
        }

        let symtab = sections
            .get(section.header.sh_link.get() as usize)
            .read_error("bad relocation symbol table section index")?;
        let symbols = read_symbols(symtab)?;

        let count = section.data.len() / mem::size_of::<elf::Rel>();
        let relocations = section
            .data
            .read_slice_at::<elf::Rel>(0, count)
            .read_error("bad relocation section")?;

        for relocation in relocations {
            apply_relocation(
                vm,
                sections,
                strings,
                functions,
                linked,
                applies_to,
                symbols,
                relocation,
            )?;
        }
    }
    Ok(())
}

fn apply_relocation(
    vm: &Vm,
    sections: &[Section<'_>],
    strings: StringTable<'_>,
    functions: &[Function<'_>],
    linked: &mut [u8],
    applies_to: usize,
    symbols: &[elf::Sym],
    relocation: &elf::Rel,
) -> Result<()> {
    let bad = |message: String| Err(Error::BadRelocation(message));

    let sym = symbols
        .get(relocation.r_sym() as usize)
        .read_error("a relocation contained a bad symbol index")?;
    let name = strings
        .get(sym.st_name.get())
        .read_error("a relocation's symbol contained a bad name")?;

    // Attribute the patched location to the function containing it.
    let r_offset = relocation.r_offset.get();
    let function = functions
        .iter()
        .find(|f| {
            f.section == applies_to
                && r_offset >= f.section_start
                && r_offset < f.section_start + f.size
        })
        .read_error("an instruction with a relocation is outside any function")?;

    // The patched record must lie fully inside its function.
    if (r_offset - function.section_start) + 8 > function.size {
        return bad("bad relocation offset".into());
    }

    // Byte and instruction offsets of the patched record in the linked
    // program.
    let patch_offset = function.linked_offset + (r_offset - function.section_start) as usize;
    let patch_index = function.insn_offset + (r_offset - function.section_start) as usize / 8;

    match relocation.r_type() {
        elf::R_BPF_64_64 => {
            if (r_offset - function.section_start) + 16 > function.size {
                return bad("bad R_BPF_64_64 relocation offset".into());
            }
            if linked[patch_offset] != ebpf::LDDW {
                return bad("bad R_BPF_64_64 relocation instruction".into());
            }
            let data_section = sections
                .get(sym.st_shndx.get() as usize)
                .read_error("bad R_BPF_64_64 relocation section index")?;
            if !data_section.is_writable_data() {
                return bad("bad R_BPF_64_64 relocation section".into());
            }
            let end = sym.st_value.get().checked_add(sym.st_size.get());
            if end.map_or(true, |end| end > data_section.data.len() as u64) {
                return bad("bad R_BPF_64_64 size".into());
            }
            let relocate = match &vm.data_relocation {
                Some(relocate) => relocate,
                None => return bad("R_BPF_64_64 data relocation function not set".into()),
            };
            let value = relocate(
                data_section.data.0,
                name,
                sym.st_value.get(),
                sym.st_size.get(),
            );
            // The 64-bit value is split across the two halves of the lddw
            // pair.
            patch_imm(linked, patch_offset, value as u32 as i32);
            patch_imm(linked, patch_offset + 8, (value >> 32) as u32 as i32);
        }
        elf::R_BPF_64_32 => {
            let src = linked[patch_offset + 1] >> 4;
            if src == 1 {
                // Local call: the immediate is the 8-byte-unit distance
                // from the original section start to the target function.
                let imm = read_imm(linked, patch_offset);
                let target_offset = (i64::from(imm) + 1) * 8;
                let target = functions
                    .iter()
                    .find(|f| {
                        f.section == sym.st_shndx.get() as usize
                            && target_offset == f.section_start as i64
                    })
                    .read_error(
                        "relocated target of a function call does not point to a known function",
                    )?;
                patch_imm(
                    linked,
                    patch_offset,
                    (target.insn_offset as i64 - (patch_index as i64 + 1)) as i32,
                );
            } else {
                // Helper reference: resolve the symbol name to a
                // registered helper index.
                match vm.helper_by_name(name) {
                    Some(index) => patch_imm(linked, patch_offset, index as i32),
                    None => return bad(format!("function '{}' not found", name)),
                }
            }
        }
        r_type => {
            log::warn!("skipping unknown relocation type {}", r_type);
        }
    }
    Ok(())
}

fn read_imm(linked: &[u8], insn_offset: usize) -> i32 {
    let bytes = [
        linked[insn_offset + 4],
        linked[insn_offset + 5],
        linked[insn_offset + 6],
        linked[insn_offset + 7],
    ];
    i32::from_le_bytes(bytes)
}

fn patch_imm(linked: &mut [u8], insn_offset: usize, imm: i32) {
    linked[insn_offset + 4..insn_offset + 8].copy_from_slice(&imm.to_le_bytes());
}
