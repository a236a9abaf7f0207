//! Relocatable object files.
//!
//! An `InputObject` is the per-file parsed state: section slots, the raw
//! symbol table, comdat groups, and mergeable-string payloads. The per-file
//! passes that the resolver and scanner fan out over live here as methods.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};

use anyhow::{bail, Result};
use fxhash::FxHashMap;
use object::elf::{self, FileHeader64, Rela64};
use object::read::elf::{FileHeader as _, Rela as _, SectionHeader as _, Sym as _};
use object::LittleEndian;

use crate::input::MappedFile;
use crate::merge::Frag;
use crate::symbol::{
    def_rank, FileId, SymRef, SymbolTable, FILE_NONE, SEC_NONE,
};

const LE: LittleEndian = LittleEndian;

/// A raw symbol-table entry with its name resolved.
#[derive(Clone, Copy, Debug)]
pub struct ESym {
    pub name: &'static [u8],
    pub value: u64,
    pub size: u64,
    pub shndx: u16,
    pub info: u8,
    pub other: u8,
}

impl ESym {
    pub fn st_bind(&self) -> u8 {
        self.info >> 4
    }
    pub fn st_type(&self) -> u8 {
        self.info & 0xf
    }
    pub fn st_visibility(&self) -> u8 {
        self.other & 3
    }
    pub fn is_weak(&self) -> bool {
        self.st_bind() == elf::STB_WEAK
    }
    pub fn is_undef(&self) -> bool {
        self.shndx == elf::SHN_UNDEF
    }
    pub fn is_abs(&self) -> bool {
        self.shndx == elf::SHN_ABS
    }
    pub fn is_common(&self) -> bool {
        self.shndx == elf::SHN_COMMON
    }
    pub fn is_defined(&self) -> bool {
        !self.is_undef()
    }
}

pub fn rel_split(rel: &Rela64<LittleEndian>) -> (u32, u32) {
    (rel.r_sym(LE, false), rel.r_type(LE, false))
}

pub fn rel_offset(rel: &Rela64<LittleEndian>) -> u64 {
    rel.r_offset(LE)
}

pub fn rel_addend(rel: &Rela64<LittleEndian>) -> i64 {
    rel.r_addend(LE)
}

/// A section from an input file that will be copied into an output section.
pub struct InputSection {
    pub shndx: u32,
    pub name: &'static [u8],
    pub sh_type: u32,
    pub sh_flags: u64,
    pub addralign: u64,
    pub entsize: u64,
    pub size: u64,
    pub data: &'static [u8],
    pub rels: &'static [Rela64<LittleEndian>],
    /// (relocation index, piece, rebased addend) for relocations targeting
    /// local symbols in mergeable sections. Sorted by relocation index.
    pub rel_pieces: Vec<(u32, crate::merge::PieceRef, i64)>,
    /// Output section id, assigned when sections are registered.
    pub osec: u32,
    /// Offset within the output section, assigned during layout.
    pub offset: AtomicU64,
    alive: AtomicBool,
}

impl InputSection {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn kill(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }
}

/// A SHF_MERGE|SHF_STRINGS input section, split into string pieces instead
/// of being copied wholesale.
pub struct MergeableSection {
    pub shndx: u32,
    pub name: &'static [u8],
    pub sh_type: u32,
    pub sh_flags: u64,
    pub addralign: u64,
    pub data: &'static [u8],
    /// Merged-section registry id.
    pub merged: u32,
    /// Global ordinal across all mergeable sections.
    pub ordinal: u32,
    pub frags: Vec<Frag>,
    /// Bytes of pieces this section ended up owning.
    pub size: u64,
    /// Offset within the merged parent section.
    pub offset: u64,
    pub padding: u64,
}

pub enum SectionSlot {
    None,
    Regular(InputSection),
    Merged(u32),
}

/// Need flags and table slots for local symbols; locals are not interned,
/// so the scanner records their GOT/PLT needs here instead.
#[derive(Default)]
pub struct LocalState {
    pub flags: AtomicU32,
    pub got_idx: AtomicI32,
    pub gottpoff_idx: AtomicI32,
    pub plt_idx: AtomicI32,
    pub pltgot_idx: AtomicI32,
}

impl LocalState {
    fn new() -> LocalState {
        LocalState {
            flags: AtomicU32::new(0),
            got_idx: AtomicI32::new(-1),
            gottpoff_idx: AtomicI32::new(-1),
            plt_idx: AtomicI32::new(-1),
            pltgot_idx: AtomicI32::new(-1),
        }
    }
}

/// Sizes and offsets of this file's contribution to .symtab/.strtab.
#[derive(Default, Clone, Copy)]
pub struct SymtabPlan {
    pub num_locals: u64,
    pub num_globals: u64,
    pub local_strtab: u64,
    pub global_strtab: u64,
    pub local_symtab_off: u64,
    pub global_symtab_off: u64,
    pub local_strtab_off: u64,
    pub global_strtab_off: u64,
}

/// Comdat group signatures, interned process-wide. The owner of each group
/// is the lowest-priority file that defines it.
#[derive(Default)]
pub struct ComdatRegistry {
    map: FxHashMap<&'static [u8], usize>,
    pub owners: Vec<AtomicU32>,
}

impl ComdatRegistry {
    pub fn get_or_create(&mut self, signature: &'static [u8]) -> usize {
        let owners = &mut self.owners;
        *self.map.entry(signature).or_insert_with(|| {
            owners.push(AtomicU32::new(u32::MAX));
            owners.len() - 1
        })
    }
}

pub struct InputObject {
    pub id: FileId,
    pub name: String,
    pub priority: u32,
    pub is_alive: AtomicBool,
    pub is_in_lib: bool,
    pub has_error: AtomicBool,
    pub first_global: usize,
    pub esyms: Vec<ESym>,
    /// Interned handles, one per global symbol (esym index - first_global).
    pub globals: Vec<SymRef>,
    pub local_state: Vec<LocalState>,
    pub sections: Vec<SectionSlot>,
    pub mergeable: Vec<MergeableSection>,
    /// (signature, member section indices) straight from SHT_GROUP.
    pub comdat_defs: Vec<(&'static [u8], Vec<u32>)>,
    /// Registered (group id, member section indices).
    pub comdats: Vec<(usize, Vec<u32>)>,
    pub symtab_plan: SymtabPlan,
}

impl InputObject {
    /// Parses a relocatable object. Interns its global symbol names but
    /// does not publish any definition; that happens in the resolver.
    pub fn parse(
        mb: &MappedFile,
        archive_name: Option<&str>,
        in_lib: bool,
        symbols: &SymbolTable,
    ) -> Result<InputObject> {
        let data = mb.data;
        let name = match archive_name {
            Some(ar) => format!("{}({})", ar, mb.name),
            None => mb.name.clone(),
        };

        let ehdr = FileHeader64::<LittleEndian>::parse(data)?;
        if ehdr.e_machine.get(LE) != elf::EM_X86_64 {
            bail!("{}: unsupported machine type {}", name, ehdr.e_machine.get(LE));
        }
        let sections = ehdr.sections(LE, data)?;

        // Symbol table.
        let mut esyms = Vec::new();
        let mut first_global = 0usize;
        let symtab = sections.symbols(LE, data, elf::SHT_SYMTAB)?;
        for shdr in sections.iter() {
            if shdr.sh_type(LE) == elf::SHT_SYMTAB {
                first_global = shdr.sh_info(LE) as usize;
                break;
            }
        }
        for sym in symtab.iter() {
            esyms.push(ESym {
                name: symtab.symbol_name(LE, sym)?,
                value: sym.st_value(LE),
                size: sym.st_size(LE),
                shndx: sym.st_shndx(LE),
                info: sym.st_info(),
                other: sym.st_other(),
            });
        }
        if first_global > esyms.len() {
            bail!("{}: corrupt symbol table", name);
        }

        // Section slots.
        let mut slots: Vec<SectionSlot> = Vec::with_capacity(sections.len());
        let mut mergeable = Vec::new();
        let mut comdat_defs = Vec::new();
        for (i, shdr) in sections.iter().enumerate() {
            let sh_type = shdr.sh_type(LE);
            let sh_flags = shdr.sh_flags(LE);
            let sec_name = sections.section_name(LE, shdr)?;

            match sh_type {
                elf::SHT_NULL | elf::SHT_SYMTAB | elf::SHT_STRTAB | elf::SHT_REL
                | elf::SHT_RELA | elf::SHT_SYMTAB_SHNDX => {
                    slots.push(SectionSlot::None);
                    continue;
                }
                elf::SHT_GROUP => {
                    let (signature, members) =
                        parse_group(&name, shdr, data, &esyms)?;
                    if let Some(signature) = signature {
                        comdat_defs.push((signature, members));
                    }
                    slots.push(SectionSlot::None);
                    continue;
                }
                _ => {}
            }
            if sh_flags & u64::from(elf::SHF_EXCLUDE) != 0 || sec_name == b".note.GNU-stack" {
                slots.push(SectionSlot::None);
                continue;
            }

            let payload = shdr.data(LE, data)?;
            let is_strings = sh_flags & u64::from(elf::SHF_MERGE) != 0
                && sh_flags & u64::from(elf::SHF_STRINGS) != 0
                && shdr.sh_entsize(LE) == 1;
            if is_strings {
                slots.push(SectionSlot::Merged(mergeable.len() as u32));
                mergeable.push(MergeableSection {
                    shndx: i as u32,
                    name: sec_name,
                    sh_type,
                    sh_flags,
                    addralign: shdr.sh_addralign(LE).max(1),
                    data: payload,
                    merged: 0,
                    ordinal: 0,
                    frags: Vec::new(),
                    size: 0,
                    offset: 0,
                    padding: 0,
                });
            } else {
                slots.push(SectionSlot::Regular(InputSection {
                    shndx: i as u32,
                    name: sec_name,
                    sh_type,
                    sh_flags,
                    addralign: shdr.sh_addralign(LE).max(1),
                    entsize: shdr.sh_entsize(LE),
                    size: shdr.sh_size(LE),
                    data: payload,
                    rels: &[],
                    rel_pieces: Vec::new(),
                    osec: 0,
                    offset: AtomicU64::new(0),
                    alive: AtomicBool::new(true),
                }));
            }
        }

        // Attach relocations to their target sections.
        for shdr in sections.iter() {
            if shdr.sh_type(LE) != elf::SHT_RELA {
                continue;
            }
            if let Some((rels, _)) = shdr.rela(LE, data)? {
                let target = shdr.sh_info(LE) as usize;
                if let Some(SectionSlot::Regular(isec)) = slots.get_mut(target) {
                    isec.rels = rels;
                }
            }
        }

        let globals: Vec<SymRef> = esyms[first_global.min(esyms.len())..]
            .iter()
            .map(|esym| symbols.intern(esym.name))
            .collect();
        let local_state = (0..first_global).map(|_| LocalState::new()).collect();

        Ok(InputObject {
            id: 0,
            name,
            priority: 0,
            is_alive: AtomicBool::new(!in_lib),
            is_in_lib: in_lib,
            has_error: AtomicBool::new(false),
            first_global,
            esyms,
            globals,
            local_state,
            sections: slots,
            mergeable,
            comdat_defs,
            comdats: Vec::new(),
            symtab_plan: SymtabPlan::default(),
        })
    }

    /// The synthetic internal object that owns linker-defined symbols.
    pub fn internal() -> InputObject {
        InputObject {
            id: 0,
            name: "<internal>".to_string(),
            priority: crate::symbol::INTERNAL_PRIORITY,
            is_alive: AtomicBool::new(true),
            is_in_lib: false,
            has_error: AtomicBool::new(false),
            first_global: 0,
            esyms: Vec::new(),
            globals: Vec::new(),
            local_state: Vec::new(),
            sections: Vec::new(),
            mergeable: Vec::new(),
            comdat_defs: Vec::new(),
            comdats: Vec::new(),
            symtab_plan: SymtabPlan::default(),
        }
    }

    pub fn global_sym(&self, esym_idx: usize) -> SymRef {
        self.globals[esym_idx - self.first_global]
    }

    /// True for the synthetic internal object, whose globals have no
    /// backing symbol-table entries (they were claimed at interning time).
    fn is_synthetic(&self) -> bool {
        self.esyms.is_empty()
    }

    /// Phase A: publish every defined global into the shared symbol table,
    /// electing the owner by (strength, file priority).
    pub fn resolve_symbols(&self) {
        if self.is_synthetic() {
            return;
        }
        for (slot, &sym) in self.globals.iter().enumerate() {
            let esym = &self.esyms[self.first_global + slot];
            if esym.is_undef() {
                continue;
            }
            let rank = def_rank(esym.st_bind(), esym.is_common(), self.priority);
            let mut st = sym.lock();
            if rank < st.rank {
                st.rank = rank;
                st.file = self.id as i32;
                st.value = if esym.is_common() { 0 } else { esym.value };
                st.sec = if esym.is_abs() || esym.is_common() {
                    SEC_NONE
                } else {
                    i32::from(esym.shndx)
                };
                st.sym_type = esym.st_type();
                st.binding = esym.st_bind();
                st.visibility = esym.st_visibility();
                st.ver_idx = 0;
                st.placeholder = !self.is_alive.load(Ordering::Relaxed);
                st.is_imported = false;
                st.piece = None;
                st.common_align = if esym.is_common() { esym.value.max(1) } else { 1 };
                st.esize = esym.size;
                if sym.is_traced() {
                    tracing::info!("trace-symbol: {} defined in {}", sym.name_str(), self.name);
                }
            }
        }
    }

    /// Phase B step: follow this live object's undefined references and
    /// wake the files that define them. Newly woken objects are pushed to
    /// `feeder` for the caller to traverse.
    pub fn mark_live_objects(
        &self,
        files: &[crate::session::InputFile],
        feeder: &mut Vec<FileId>,
    ) {
        if self.is_synthetic() {
            return;
        }
        for (slot, &sym) in self.globals.iter().enumerate() {
            let esym = &self.esyms[self.first_global + slot];
            if !esym.is_undef() || esym.is_weak() {
                continue;
            }
            let st = sym.lock();
            if st.file == FILE_NONE {
                continue;
            }
            let target = st.file as u32;
            drop(st);
            match &files[target as usize] {
                crate::session::InputFile::Obj(obj) => {
                    if !obj.is_alive.swap(true, Ordering::SeqCst) {
                        if sym.is_traced() {
                            tracing::info!(
                                "trace-symbol: {} pulls in {}", sym.name_str(), obj.name
                            );
                        }
                        feeder.push(target);
                    }
                }
                crate::session::InputFile::Dso(dso) => {
                    dso.is_alive.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    /// Converts common symbols this file owns into fresh .bss sections.
    pub fn convert_common_symbols(&mut self) {
        if self.is_synthetic() {
            return;
        }
        for (slot, &sym) in self.globals.iter().enumerate() {
            let esym = &self.esyms[self.first_global + slot];
            if !esym.is_common() {
                continue;
            }
            let mut st = sym.lock();
            if st.file != self.id as i32 || st.sec != SEC_NONE || st.rank >> 32 != 2 {
                continue;
            }
            let shndx = self.sections.len() as u32;
            self.sections.push(SectionSlot::Regular(InputSection {
                shndx,
                name: b".bss",
                sh_type: elf::SHT_NOBITS,
                sh_flags: u64::from(elf::SHF_ALLOC | elf::SHF_WRITE),
                addralign: st.common_align,
                entsize: 0,
                size: st.esize,
                data: &[],
                rels: &[],
                rel_pieces: Vec::new(),
                osec: 0,
                offset: AtomicU64::new(0),
                alive: AtomicBool::new(true),
            }));
            st.sec = shndx as i32;
            st.value = 0;
        }
    }

    /// Weak undefined symbols that nobody defined resolve to absolute 0.
    pub fn handle_undefined_weak_symbols(&self) {
        if self.is_synthetic() {
            return;
        }
        for (slot, &sym) in self.globals.iter().enumerate() {
            let esym = &self.esyms[self.first_global + slot];
            if !esym.is_undef() || !esym.is_weak() {
                continue;
            }
            let mut st = sym.lock();
            if st.file == FILE_NONE {
                st.file = self.id as i32;
                st.sec = SEC_NONE;
                st.value = 0;
                st.binding = elf::STB_WEAK;
                st.placeholder = false;
            }
        }
    }

    /// When emitting a shared object, remaining undefined symbols are
    /// imports to be resolved at load time, not errors.
    pub fn claim_unresolved_symbols(&self) {
        if self.is_synthetic() {
            return;
        }
        for (slot, &sym) in self.globals.iter().enumerate() {
            let esym = &self.esyms[self.first_global + slot];
            if !esym.is_undef() || esym.is_weak() {
                continue;
            }
            let mut st = sym.lock();
            if st.file == FILE_NONE {
                st.file = self.id as i32;
                st.sec = SEC_NONE;
                st.value = 0;
                st.is_imported = true;
                st.placeholder = false;
            }
        }
    }

    /// Local symbols that make it into .symtab: named, not
    /// section/file markers, and not in a dropped section.
    pub fn symtab_locals(&self) -> Vec<(usize, &ESym)> {
        let end = self.first_global.min(self.esyms.len());
        let mut out = Vec::new();
        for (i, esym) in self.esyms[..end].iter().enumerate().skip(1) {
            if esym.name.is_empty()
                || esym.st_type() == elf::STT_SECTION
                || esym.st_type() == elf::STT_FILE
                || esym.is_undef()
            {
                continue;
            }
            if !esym.is_abs() {
                match self.sections.get(esym.shndx as usize) {
                    Some(SectionSlot::Regular(isec)) if isec.is_alive() => {}
                    Some(SectionSlot::Merged(_)) => {}
                    _ => continue,
                }
            }
            out.push((i, esym));
        }
        out
    }

    /// Global symbols this file owns, for .symtab. Imports claimed only to
    /// satisfy a shared-library link carry no definition and stay out.
    pub fn symtab_globals(&self, id: FileId) -> Vec<SymRef> {
        self.globals
            .iter()
            .copied()
            .filter(|sym| {
                let st = sym.lock();
                st.file == id as i32 && !(st.is_imported && st.sec == SEC_NONE)
            })
            .collect()
    }

    /// Counts this file's .symtab/.strtab contribution.
    pub fn compute_symtab(&mut self) {
        let mut plan = SymtabPlan::default();
        for (_, esym) in self.symtab_locals() {
            plan.num_locals += 1;
            plan.local_strtab += esym.name.len() as u64 + 1;
        }
        for sym in self.symtab_globals(self.id) {
            plan.num_globals += 1;
            plan.global_strtab += sym.name.len() as u64 + 1;
        }
        self.symtab_plan = plan;
    }
}

fn parse_group(
    name: &str,
    shdr: &object::elf::SectionHeader64<LittleEndian>,
    data: &'static [u8],
    esyms: &[ESym],
) -> Result<(Option<&'static [u8]>, Vec<u32>)> {
    let payload = shdr.data(LE, data)?;
    let words: &[object::endian::U32<LittleEndian>] = object::pod::slice_from_all_bytes(payload)
        .map_err(|_| anyhow::anyhow!("{}: malformed SHT_GROUP section", name))?;
    let Some((flags, members)) = words.split_first() else {
        return Ok((None, Vec::new()));
    };
    if flags.get(LE) & elf::GRP_COMDAT == 0 {
        return Ok((None, Vec::new()));
    }
    let sig_idx = shdr.sh_info(LE) as usize;
    let signature = esyms
        .get(sig_idx)
        .map(|esym| esym.name)
        .ok_or_else(|| anyhow::anyhow!("{}: bad comdat signature index", name))?;
    Ok((Some(signature), members.iter().map(|w| w.get(LE)).collect()))
}

/// Comdat deduplication: every group elects the lowest-priority file, then
/// losers drop their member sections.
pub fn register_comdats(
    files: &mut [crate::session::InputFile],
    objs: &[FileId],
    registry: &mut ComdatRegistry,
) {
    for &id in objs {
        let crate::session::InputFile::Obj(obj) = &mut files[id as usize] else { continue };
        let defs = std::mem::take(&mut obj.comdat_defs);
        obj.comdats = defs
            .into_iter()
            .map(|(signature, members)| (registry.get_or_create(signature), members))
            .collect();
    }
}

pub fn resolve_comdat_groups(sess: &crate::session::LinkSession) {
    use rayon::prelude::*;
    sess.objs.par_iter().for_each(|&id| {
        let obj = sess.obj(id);
        for (gid, _) in &obj.comdats {
            sess.comdats.owners[*gid].fetch_min(obj.priority, Ordering::Relaxed);
        }
    });
}

pub fn eliminate_duplicate_comdat_groups(sess: &crate::session::LinkSession) {
    use rayon::prelude::*;
    sess.objs.par_iter().for_each(|&id| {
        let obj = sess.obj(id);
        for (gid, members) in &obj.comdats {
            if sess.comdats.owners[*gid].load(Ordering::Relaxed) != obj.priority {
                for &shndx in members {
                    if let Some(SectionSlot::Regular(isec)) = obj.sections.get(shndx as usize) {
                        isec.kill();
                    }
                }
            }
        }
    });
}
