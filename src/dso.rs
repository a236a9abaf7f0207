//! Shared objects.
//!
//! A DSO on the command line contributes its exported dynamic symbols to
//! resolution and records which version each export carries; at output time
//! those feed `.gnu.version_r`. Nothing of a DSO is copied into the output.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Result};
use object::elf::{self, FileHeader64};
use object::read::elf::{Dyn as _, FileHeader as _, ProgramHeader as _, SectionHeader as _, Sym as _};
use object::LittleEndian;

use crate::input::MappedFile;
use crate::obj::ESym;
use crate::symbol::{def_rank, FileId, SymRef, SymbolTable, SEC_NONE};

const LE: LittleEndian = LittleEndian;

pub struct SharedObject {
    pub id: FileId,
    pub name: String,
    pub soname: String,
    pub as_needed: bool,
    pub priority: u32,
    pub is_alive: AtomicBool,
    /// Exported (defined) dynamic symbols.
    pub esyms: Vec<ESym>,
    /// Version index of each export, VERSYM_HIDDEN stripped.
    pub versyms: Vec<u16>,
    pub symbols: Vec<SymRef>,
    /// Symbols this DSO itself needs; if an object file defines one, that
    /// definition must be exported.
    pub undefs: Vec<SymRef>,
    /// Version index → version name, from SHT_GNU_verdef.
    pub version_names: Vec<&'static [u8]>,
    /// PT_LOAD ranges for read-only classification: (vaddr, memsz, flags).
    loads: Vec<(u64, u64, u32)>,
}

impl SharedObject {
    pub fn parse(mb: &MappedFile, as_needed: bool, symbols: &SymbolTable) -> Result<SharedObject> {
        let data = mb.data;
        let ehdr = FileHeader64::<LittleEndian>::parse(data)?;
        if ehdr.e_machine.get(LE) != elf::EM_X86_64 {
            bail!("{}: unsupported machine type {}", mb.name, ehdr.e_machine.get(LE));
        }
        let sections = ehdr.sections(LE, data)?;
        let dynsyms = sections.symbols(LE, data, elf::SHT_DYNSYM)?;

        // DT_SONAME, defaulting to the file name.
        let mut soname = base_name(&mb.name).to_string();
        for shdr in sections.iter() {
            if shdr.sh_type(LE) != elf::SHT_DYNAMIC {
                continue;
            }
            if let Some((dyns, link)) = shdr.dynamic(LE, data)? {
                let strings = sections.strings(LE, data, link)?;
                for d in dyns {
                    if d.d_tag(LE) == u64::from(elf::DT_SONAME) {
                        if let Ok(name) = strings.get(d.d_val(LE) as u32) {
                            soname = String::from_utf8_lossy(name).into_owned();
                        }
                    }
                }
            }
        }

        // Version definitions.
        let mut version_names: Vec<&'static [u8]> = vec![b"", b""];
        if let Some((mut verdefs, _)) = sections.gnu_verdef(LE, data)? {
            let strings = dynsyms.strings();
            while let Some((verdef, mut verdauxs)) = verdefs.next()? {
                let idx = (verdef.vd_ndx.get(LE) & elf::VERSYM_VERSION) as usize;
                let name = match verdauxs.next()? {
                    Some(aux) => aux.name(LE, strings)?,
                    None => b"",
                };
                if version_names.len() <= idx {
                    version_names.resize(idx + 1, b"");
                }
                version_names[idx] = name;
            }
        }

        let raw_versyms = sections.gnu_versym(LE, data)?.map(|(v, _)| v);

        let mut esyms = Vec::new();
        let mut versyms = Vec::new();
        let mut syms = Vec::new();
        let mut undefs = Vec::new();
        for (i, sym) in dynsyms.iter().enumerate() {
            if i == 0 {
                continue;
            }
            let name = dynsyms.symbol_name(LE, sym)?;
            let bind = sym.st_info() >> 4;
            if bind == elf::STB_LOCAL || name.is_empty() {
                continue;
            }
            if sym.st_shndx(LE) == elf::SHN_UNDEF {
                if bind != elf::STB_WEAK {
                    undefs.push(symbols.intern(name));
                }
                continue;
            }
            let versym = raw_versyms
                .and_then(|v| v.get(i))
                .map(|v| v.0.get(LE) & elf::VERSYM_VERSION)
                .unwrap_or(elf::VER_NDX_GLOBAL);
            esyms.push(ESym {
                name,
                value: sym.st_value(LE),
                size: sym.st_size(LE),
                shndx: sym.st_shndx(LE),
                info: sym.st_info(),
                other: sym.st_other(),
            });
            versyms.push(versym);
            syms.push(symbols.intern(name));
        }

        let mut loads = Vec::new();
        for phdr in ehdr.program_headers(LE, data)? {
            if phdr.p_type(LE) == elf::PT_LOAD {
                loads.push((phdr.p_vaddr(LE), phdr.p_memsz(LE), phdr.p_flags(LE)));
            }
        }

        Ok(SharedObject {
            id: 0,
            name: mb.name.clone(),
            soname,
            as_needed,
            priority: 0,
            is_alive: AtomicBool::new(!as_needed),
            esyms,
            versyms,
            symbols: syms,
            undefs,
            version_names,
            loads,
        })
    }

    /// Phase A for a DSO: exports participate in the election like object
    /// definitions, but carry their version index and never a section.
    pub fn resolve_symbols(&self) {
        for (i, &sym) in self.symbols.iter().enumerate() {
            let esym = &self.esyms[i];
            let rank = def_rank(esym.st_bind(), false, self.priority);
            let mut st = sym.lock();
            if rank < st.rank {
                st.rank = rank;
                st.file = self.id as i32;
                st.value = esym.value;
                st.sec = SEC_NONE;
                st.sym_type = esym.st_type();
                st.binding = esym.st_bind();
                st.visibility = esym.st_visibility();
                st.ver_idx = self.versyms[i];
                st.placeholder = false;
                st.piece = None;
                st.esize = esym.size;
                if sym.is_traced() {
                    tracing::info!("trace-symbol: {} defined in {}", sym.name_str(), self.name);
                }
            }
        }
    }

    pub fn version_name(&self, ver_idx: u16) -> &'static [u8] {
        self.version_names.get(ver_idx as usize).copied().unwrap_or(b"")
    }

    /// Other exports of this DSO that alias `value`. When a copy
    /// relocation grabs one name of a multi-name data object, every alias
    /// must follow the copy.
    pub fn find_aliases(&self, value: u64, except: SymRef) -> Vec<SymRef> {
        let mut out = Vec::new();
        for (i, &sym) in self.symbols.iter().enumerate() {
            if self.esyms[i].value == value && !std::ptr::eq(sym, except) {
                out.push(sym);
            }
        }
        out
    }

    /// True if `value` lives in a read-only PT_LOAD of this DSO, which
    /// decides between .bss and .bss.rel.ro for the copy.
    pub fn is_readonly(&self, value: u64) -> bool {
        self.loads.iter().any(|&(vaddr, memsz, flags)| {
            flags & elf::PF_W == 0 && vaddr <= value && value < vaddr + memsz
        })
    }

    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::SeqCst);
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
