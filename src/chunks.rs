//! Output chunks.
//!
//! Everything that occupies a range of the output file is an `OutChunk`:
//! the ELF header, the program and section header tables, synthesized
//! sections (GOT, PLT, dynamic tables, hashes, version tables, symbol
//! tables), regular output sections, and merged string sections. A chunk
//! answers two questions: how big am I and what are my header fields
//! (`update_shdr`), and what bytes do I contribute (`copy_chunk`).

use std::sync::atomic::Ordering;

use fxhash::FxHashMap;
use object::elf;
use object::endian::{U16, U32, U64};
use object::pod::bytes_of;
use object::LittleEndian;
use rayon::prelude::*;

use crate::config::HashStyle;
use crate::elf::{elf_hash, gnu_hash, Shdr};
use crate::obj::{InputObject, SectionSlot};
use crate::reloc::{GotKind, SymSlot};
use crate::session::{InputFile, LinkSession, GOT_ENTRY_SIZE, PLT_ENTRY_SIZE, PLT_HDR_SIZE};
use crate::symbol::{FileId, SymRef, Symbol};

const LE: LittleEndian = LittleEndian;

fn u16v(v: u16) -> U16<LittleEndian> {
    U16::new(LE, v)
}
fn u32v(v: u32) -> U32<LittleEndian> {
    U32::new(LE, v)
}
fn u64v(v: u64) -> U64<LittleEndian> {
    U64::new(LE, v)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Ehdr,
    Phdr,
    Shdr,
    Interp,
    Got,
    GotPlt,
    Plt,
    PltGot,
    RelPlt,
    RelDyn,
    Dynamic,
    Dynsym,
    Dynstr,
    Hash,
    GnuHash,
    Versym,
    Verneed,
    Symtab,
    Strtab,
    Shstrtab,
    Copyrel,
    CopyrelRelro,
    BuildId,
    Regular(u32),
    Merged(u32),
}

pub struct OutChunk {
    pub kind: ChunkKind,
    pub name: &'static [u8],
    /// Headers get no section header table entry.
    pub is_header: bool,
    pub shdr: Shdr,
    pub shndx: u32,
    pub starts_new_ptload: bool,
}

impl OutChunk {
    fn new(
        kind: ChunkKind,
        name: &'static [u8],
        sh_type: u32,
        sh_flags: u64,
        addralign: u64,
        entsize: u64,
    ) -> OutChunk {
        OutChunk {
            kind,
            name,
            is_header: matches!(kind, ChunkKind::Ehdr | ChunkKind::Phdr | ChunkKind::Shdr),
            shdr: Shdr {
                sh_type,
                sh_flags,
                sh_addralign: addralign,
                sh_entsize: entsize,
                ..Shdr::default()
            },
            shndx: 0,
            starts_new_ptload: false,
        }
    }
}

/// A string table under construction; identical strings share an offset.
#[derive(Default)]
pub struct StrTab {
    data: Vec<u8>,
    map: FxHashMap<Vec<u8>, u32>,
}

impl StrTab {
    pub fn add(&mut self, s: &[u8]) -> u32 {
        if self.data.is_empty() {
            self.data.push(0);
        }
        if let Some(&off) = self.map.get(s) {
            return off;
        }
        let off = self.data.len() as u32;
        self.data.extend_from_slice(s);
        self.data.push(0);
        self.map.insert(s.to_vec(), off);
        off
    }

    pub fn lookup(&self, s: &[u8]) -> u32 {
        self.map.get(s).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        if self.data.is_empty() {
            1
        } else {
            self.data.len()
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Contents of the synthesized sections, accumulated by the aggregation
/// pass and rendered by `copy_chunk`.
#[derive(Default)]
pub struct Synthetics {
    pub got_entries: Vec<(SymSlot, GotKind)>,
    pub num_got_slots: u32,
    pub tlsld_idx: Option<u32>,
    pub plt_syms: Vec<SymSlot>,
    pub pltgot_syms: Vec<SymSlot>,
    pub dynsyms: Vec<SymRef>,
    pub dynstr: StrTab,
    pub copyrel_syms: Vec<SymRef>,
    pub copyrel_size: u64,
    pub copyrel_relro_size: u64,
    pub versym: Vec<u16>,
    pub verneed: Vec<u8>,
    pub verneed_count: u32,
    pub gnu_nbuckets: u32,
    pub dynsym_symndx: u32,
    pub needed_offs: Vec<u32>,
    pub soname_off: Option<u32>,
    pub rpath_off: Option<u32>,
    pub shstrtab: Vec<u8>,
    pub symtab_nlocals: u64,
    pub symtab_nglobals: u64,
    pub strtab_size: u64,
}

/// Builds the ordered chunk list: synthesized sections first (in a fixed
/// creation order), then regular and merged sections sorted by
/// (name, type, flags) for determinism, the whole list stable-sorted by
/// section rank, and finally the file headers spliced around it.
#[tracing::instrument(skip_all, name = "Create output chunks")]
pub fn create_chunks(sess: &mut LinkSession) {
    let is_dynamic = !sess.config.is_static;
    let shared = sess.config.shared;
    let a = u64::from(elf::SHF_ALLOC);
    let w = u64::from(elf::SHF_WRITE);
    let x = u64::from(elf::SHF_EXECINSTR);

    let mut chunks: Vec<OutChunk> = Vec::new();
    chunks.push(OutChunk::new(ChunkKind::Got, b".got", elf::SHT_PROGBITS, a | w, 8, 8));
    chunks.push(OutChunk::new(ChunkKind::Plt, b".plt", elf::SHT_PROGBITS, a | x, 16, 16));
    chunks.push(OutChunk::new(ChunkKind::GotPlt, b".got.plt", elf::SHT_PROGBITS, a | w, 8, 8));
    chunks.push(OutChunk::new(ChunkKind::PltGot, b".plt.got", elf::SHT_PROGBITS, a | x, 8, 8));
    chunks.push(OutChunk::new(ChunkKind::RelPlt, b".rela.plt", elf::SHT_RELA, a, 8, 24));
    if is_dynamic {
        chunks.push(OutChunk::new(ChunkKind::RelDyn, b".rela.dyn", elf::SHT_RELA, a, 8, 24));
        chunks.push(OutChunk::new(ChunkKind::Dynamic, b".dynamic", elf::SHT_DYNAMIC, a | w, 8, 16));
        chunks.push(OutChunk::new(ChunkKind::Dynsym, b".dynsym", elf::SHT_DYNSYM, a, 8, 24));
        chunks.push(OutChunk::new(ChunkKind::Dynstr, b".dynstr", elf::SHT_STRTAB, a, 1, 0));
        chunks.push(OutChunk::new(ChunkKind::Versym, b".gnu.version", elf::SHT_GNU_VERSYM, a, 2, 2));
        chunks.push(OutChunk::new(ChunkKind::Verneed, b".gnu.version_r", elf::SHT_GNU_VERNEED, a, 8, 0));
        if matches!(sess.config.hash_style, HashStyle::Sysv | HashStyle::Both) {
            chunks.push(OutChunk::new(ChunkKind::Hash, b".hash", elf::SHT_HASH, a, 4, 4));
        }
        if matches!(sess.config.hash_style, HashStyle::Gnu | HashStyle::Both) {
            chunks.push(OutChunk::new(ChunkKind::GnuHash, b".gnu.hash", elf::SHT_GNU_HASH, a, 8, 0));
        }
    }
    chunks.push(OutChunk::new(ChunkKind::Copyrel, b".bss", elf::SHT_NOBITS, a | w, 64, 0));
    chunks.push(OutChunk::new(ChunkKind::CopyrelRelro, b".bss.rel.ro", elf::SHT_NOBITS, a | w, 64, 0));
    if sess.config.build_id != crate::config::BuildId::None {
        chunks.push(OutChunk::new(ChunkKind::BuildId, b".note.gnu.build-id", elf::SHT_NOTE, a, 4, 0));
    }
    if !sess.config.strip_all {
        chunks.push(OutChunk::new(ChunkKind::Symtab, b".symtab", elf::SHT_SYMTAB, 0, 8, 24));
        chunks.push(OutChunk::new(ChunkKind::Strtab, b".strtab", elf::SHT_STRTAB, 0, 1, 0));
    }
    chunks.push(OutChunk::new(ChunkKind::Shstrtab, b".shstrtab", elf::SHT_STRTAB, 0, 1, 0));

    // Sections are registered in an arbitrary order when inputs parse in
    // parallel; sort by key to make the output deterministic.
    let mut regular: Vec<u32> = (0..sess.osecs.defs.len() as u32).collect();
    regular.sort_by_key(|&id| {
        let def = &sess.osecs.defs[id as usize];
        (def.name, def.sh_type, def.sh_flags)
    });
    for id in regular {
        let def = &sess.osecs.defs[id as usize];
        chunks.push(OutChunk::new(
            ChunkKind::Regular(id),
            def.name,
            def.sh_type,
            def.sh_flags,
            def.addralign,
            0,
        ));
    }
    let mut merged: Vec<u32> = (0..sess.merged.defs.len() as u32).collect();
    merged.sort_by_key(|&id| {
        let def = &sess.merged.defs[id as usize];
        (def.name, def.sh_type, def.sh_flags)
    });
    for id in merged {
        let def = &sess.merged.defs[id as usize];
        chunks.push(OutChunk::new(
            ChunkKind::Merged(id),
            def.name,
            def.sh_type,
            def.sh_flags,
            def.addralign,
            0,
        ));
    }

    chunks.sort_by_key(|c| crate::elf::section_rank(&c.shdr));

    let mut list = vec![OutChunk::new(ChunkKind::Ehdr, b"", elf::SHT_NULL, a, 8, 0)];
    list.push(OutChunk::new(ChunkKind::Phdr, b"", elf::SHT_NULL, a, 8, 0));
    if is_dynamic && !shared {
        list.push(OutChunk::new(ChunkKind::Interp, b".interp", elf::SHT_PROGBITS, a, 1, 0));
    }
    list.extend(chunks);
    list.push(OutChunk::new(ChunkKind::Shdr, b"", elf::SHT_NULL, 0, 8, 0));

    sess.chunks = list;
    sess.reindex_chunks();
}

fn non_header_count(sess: &LinkSession) -> u32 {
    sess.chunks.iter().filter(|c| !c.is_header).count() as u32
}

/// Recomputes one chunk's section header from the current session state.
pub fn update_shdr(sess: &mut LinkSession, i: usize) {
    let kind = sess.chunks[i].kind;
    let mut shdr = sess.chunks[i].shdr;
    let dynsym_count = sess.synth.dynsyms.len() as u64 + 1;

    match kind {
        ChunkKind::Ehdr => shdr.sh_size = 64,
        ChunkKind::Phdr => shdr.sh_size = create_phdrs(sess).len() as u64 * 56,
        ChunkKind::Shdr => shdr.sh_size = (u64::from(non_header_count(sess)) + 1) * 64,
        ChunkKind::Interp => {
            shdr.sh_size = sess.config.dynamic_linker.len() as u64 + 1;
        }
        ChunkKind::Got => shdr.sh_size = u64::from(sess.synth.num_got_slots) * GOT_ENTRY_SIZE,
        ChunkKind::GotPlt => {
            let n = if sess.synth.plt_syms.is_empty() { 0 } else { 3 + sess.synth.plt_syms.len() };
            shdr.sh_size = n as u64 * GOT_ENTRY_SIZE;
        }
        ChunkKind::Plt => {
            shdr.sh_size = if sess.synth.plt_syms.is_empty() {
                0
            } else {
                PLT_HDR_SIZE + sess.synth.plt_syms.len() as u64 * PLT_ENTRY_SIZE
            };
        }
        ChunkKind::PltGot => shdr.sh_size = sess.synth.pltgot_syms.len() as u64 * 8,
        ChunkKind::RelPlt => {
            shdr.sh_size = sess.synth.plt_syms.len() as u64 * 24;
            shdr.sh_link = shndx_of(sess, sess.index.dynsym);
            shdr.sh_info = shndx_of(sess, sess.index.gotplt);
        }
        ChunkKind::RelDyn => {
            shdr.sh_size = reldyn_entries(sess).len() as u64 * 24;
            shdr.sh_link = shndx_of(sess, sess.index.dynsym);
        }
        ChunkKind::Dynamic => {
            shdr.sh_size = dynamic_entries(sess).len() as u64 * 16;
            shdr.sh_link = shndx_of(sess, sess.index.dynstr);
        }
        ChunkKind::Dynsym => {
            shdr.sh_size = dynsym_count * 24;
            shdr.sh_link = shndx_of(sess, sess.index.dynstr);
            shdr.sh_info = 1;
        }
        ChunkKind::Dynstr => shdr.sh_size = sess.synth.dynstr.len() as u64,
        ChunkKind::Hash => {
            shdr.sh_size = (2 + dynsym_count + dynsym_count) * 4;
            shdr.sh_link = shndx_of(sess, sess.index.dynsym);
        }
        ChunkKind::GnuHash => {
            let hashed = dynsym_count - u64::from(sess.synth.dynsym_symndx);
            shdr.sh_size = 16 + 8 + u64::from(sess.synth.gnu_nbuckets) * 4 + hashed * 4;
            shdr.sh_link = shndx_of(sess, sess.index.dynsym);
        }
        ChunkKind::Versym => {
            shdr.sh_size = if sess.synth.verneed.is_empty() { 0 } else { dynsym_count * 2 };
            shdr.sh_link = shndx_of(sess, sess.index.dynsym);
        }
        ChunkKind::Verneed => {
            shdr.sh_size = sess.synth.verneed.len() as u64;
            shdr.sh_link = shndx_of(sess, sess.index.dynstr);
            shdr.sh_info = sess.synth.verneed_count;
        }
        ChunkKind::Symtab => {
            shdr.sh_size = (1 + sess.synth.symtab_nlocals + sess.synth.symtab_nglobals) * 24;
            shdr.sh_link = shndx_of(sess, sess.index.strtab);
            shdr.sh_info = sess.synth.symtab_nlocals as u32 + 1;
        }
        ChunkKind::Strtab => shdr.sh_size = sess.synth.strtab_size,
        // The content is produced when the chunk list is finalized; never
        // let the placeholder size get this chunk pruned before that.
        ChunkKind::Shstrtab => shdr.sh_size = sess.synth.shstrtab.len().max(1) as u64,
        ChunkKind::Copyrel => shdr.sh_size = sess.synth.copyrel_size,
        ChunkKind::CopyrelRelro => shdr.sh_size = sess.synth.copyrel_relro_size,
        ChunkKind::BuildId => shdr.sh_size = 16 + sess.config.build_id.size() as u64,
        ChunkKind::Regular(id) => {
            let def = &sess.osecs.defs[id as usize];
            shdr.sh_size = def.size;
            shdr.sh_addralign = def.addralign.max(1);
        }
        ChunkKind::Merged(id) => {
            let def = &sess.merged.defs[id as usize];
            shdr.sh_size = def.size;
            shdr.sh_addralign = def.addralign.max(1);
        }
    }
    sess.chunks[i].shdr = shdr;
}

fn shndx_of(sess: &LinkSession, idx: Option<usize>) -> u32 {
    idx.map(|i| sess.chunks[i].shndx).unwrap_or(0)
}

/// Drops zero-size chunks, numbers the survivors, and builds .shstrtab.
pub fn finalize_chunk_list(sess: &mut LinkSession) {
    sess.chunks.retain(|c| c.is_header || c.shdr.sh_size != 0);

    let mut shndx = 1u32;
    for chunk in &mut sess.chunks {
        if !chunk.is_header {
            chunk.shndx = shndx;
            shndx += 1;
        }
    }

    let mut shstrtab = vec![0u8];
    let mut names: FxHashMap<&[u8], u32> = FxHashMap::default();
    for chunk in &mut sess.chunks {
        if chunk.is_header || chunk.name.is_empty() {
            continue;
        }
        let off = *names.entry(chunk.name).or_insert_with(|| {
            let off = shstrtab.len() as u32;
            shstrtab.extend_from_slice(chunk.name);
            shstrtab.push(0);
            off
        });
        chunk.shdr.sh_name = off;
    }
    sess.synth.shstrtab = shstrtab;
    sess.reindex_chunks();
}

/// Sorts .dynsym into its final order: undefined entries first, then
/// symbols defined in the output grouped by their .gnu.hash bucket, which
/// is the layout the GNU hash lookup requires.
pub fn sort_dynsym(sess: &mut LinkSession) {
    let mut items: Vec<(SymRef, bool)> = sess
        .synth
        .dynsyms
        .iter()
        .map(|&sym| (sym, !sess.sym_is_undef_in_output(sym)))
        .collect();
    let num_defined = items.iter().filter(|&&(_, defined)| defined).count() as u32;
    let nbuckets = num_defined / 8 + 1;
    sess.synth.gnu_nbuckets = nbuckets;

    items.sort_by_key(|&(sym, defined)| {
        let bucket = if defined { gnu_hash(sym.name) % nbuckets } else { 0 };
        (defined, bucket, sym.name)
    });
    for (i, &(sym, _)) in items.iter().enumerate() {
        sym.dynsym_idx.store(i as i32 + 1, Ordering::Relaxed);
    }
    sess.synth.dynsym_symndx = 1 + items.len() as u32 - num_defined;
    sess.synth.dynsyms = items.into_iter().map(|(sym, _)| sym).collect();
}

/// Builds `.gnu.version_r` from the sorted (DSO, version) pairs present in
/// .dynsym: one VERNEED per DSO, one VERNAUX per distinct version, with
/// `vna_hash` the SysV hash of the version string. Also fills `.gnu.version`.
#[tracing::instrument(skip_all, name = "Fill version tables")]
pub fn fill_verneed(sess: &mut LinkSession) {
    let mut versym = vec![1u16; sess.synth.dynsyms.len() + 1];
    versym[0] = 0;

    let mut versioned: Vec<(FileId, u16, SymRef)> = Vec::new();
    for &sym in &sess.synth.dynsyms {
        let st = sym.lock();
        if st.file < 0 || st.ver_idx <= elf::VER_NDX_GLOBAL {
            continue;
        }
        if sess.files[st.file as usize].is_dso() {
            versioned.push((st.file as u32, st.ver_idx, sym));
        }
    }
    versioned.sort_by(|a, b| {
        let sa = &sess.dso(a.0).soname;
        let sb = &sess.dso(b.0).soname;
        (sa, a.1).cmp(&(sb, b.1))
    });

    let mut buf: Vec<u8> = Vec::new();
    let mut verneed_count = 0u32;
    let mut veridx: u16 = elf::VER_NDX_GLOBAL;
    let mut last: Option<(FileId, u16)> = None;
    let mut verneed_pos: Option<usize> = None;
    let mut vernaux_pos: Option<usize> = None;

    for (fid, ver, sym) in versioned {
        if last.map(|(f, _)| f) != Some(fid) {
            // Start a new VERNEED group for this DSO.
            if let Some(pos) = verneed_pos {
                let next = (buf.len() - pos) as u32;
                buf[pos + 12..pos + 16].copy_from_slice(&next.to_le_bytes());
            }
            verneed_count += 1;
            verneed_pos = Some(buf.len());
            vernaux_pos = None;
            let soname: Vec<u8> = sess.dso(fid).soname.as_bytes().to_vec();
            let soname_off = sess.synth.dynstr.add(&soname);
            buf.extend_from_slice(&1u16.to_le_bytes()); // vn_version
            buf.extend_from_slice(&0u16.to_le_bytes()); // vn_cnt, patched
            buf.extend_from_slice(&soname_off.to_le_bytes()); // vn_file
            buf.extend_from_slice(&16u32.to_le_bytes()); // vn_aux
            buf.extend_from_slice(&0u32.to_le_bytes()); // vn_next
            last = None;
        }
        if last != Some((fid, ver)) {
            // New VERNAUX entry for this (DSO, version).
            if let Some(pos) = vernaux_pos {
                let next = (buf.len() - pos) as u32;
                buf[pos + 12..pos + 16].copy_from_slice(&next.to_le_bytes());
            }
            let pos = verneed_pos.unwrap();
            let cnt = u16::from_le_bytes([buf[pos + 2], buf[pos + 3]]) + 1;
            buf[pos + 2..pos + 4].copy_from_slice(&cnt.to_le_bytes());

            veridx += 1;
            vernaux_pos = Some(buf.len());
            let verstr = sess.dso(fid).version_name(ver);
            let name_off = sess.synth.dynstr.add(verstr);
            buf.extend_from_slice(&elf_hash(verstr).to_le_bytes()); // vna_hash
            buf.extend_from_slice(&0u16.to_le_bytes()); // vna_flags
            buf.extend_from_slice(&veridx.to_le_bytes()); // vna_other
            buf.extend_from_slice(&name_off.to_le_bytes()); // vna_name
            buf.extend_from_slice(&0u32.to_le_bytes()); // vna_next
            last = Some((fid, ver));
        }
        let idx = sym.dynsym_idx.load(Ordering::Relaxed);
        if idx > 0 {
            versym[idx as usize] = veridx;
        }
    }

    sess.synth.versym = versym;
    sess.synth.verneed = buf;
    sess.synth.verneed_count = verneed_count;
}

/// Sizes every file's .symtab contribution and lays the regions out:
/// the null entry, then all local blocks in file order, then all global
/// blocks, with .strtab regions assigned the same way.
#[tracing::instrument(skip_all, name = "Compute symtab")]
pub fn plan_symtab(sess: &mut LinkSession) {
    if sess.config.strip_all {
        return;
    }
    sess.files.par_iter_mut().for_each(|file| {
        if let InputFile::Obj(obj) = file {
            if obj.is_alive.load(Ordering::Relaxed) {
                obj.compute_symtab();
            }
        }
    });

    let mut symtab_off = 24u64;
    let mut strtab_off = 1u64;
    let objs = sess.objs.clone();
    let mut nlocals = 0u64;
    let mut nglobals = 0u64;
    for &id in &objs {
        let plan = &mut sess.obj_mut(id).symtab_plan;
        plan.local_symtab_off = symtab_off;
        plan.local_strtab_off = strtab_off;
        symtab_off += plan.num_locals * 24;
        strtab_off += plan.local_strtab;
        nlocals += plan.num_locals;
    }
    for &id in &objs {
        let plan = &mut sess.obj_mut(id).symtab_plan;
        plan.global_symtab_off = symtab_off;
        plan.global_strtab_off = strtab_off;
        symtab_off += plan.num_globals * 24;
        strtab_off += plan.global_strtab;
        nglobals += plan.num_globals;
    }
    sess.synth.symtab_nlocals = nlocals;
    sess.synth.symtab_nglobals = nglobals;
    sess.synth.strtab_size = strtab_off;
}

// ---------------------------------------------------------------------------
// Dynamic tables.

fn section_by_name(sess: &LinkSession, name: &[u8]) -> Option<(u64, u64)> {
    sess.chunks.iter().find_map(|c| {
        if !c.is_header && c.name == name && matches!(c.kind, ChunkKind::Regular(_)) {
            Some((c.shdr.sh_addr, c.shdr.sh_size))
        } else {
            None
        }
    })
}

fn chunk_pair(sess: &LinkSession, idx: Option<usize>) -> Option<(u64, u64)> {
    let i = idx?;
    let shdr = &sess.chunks[i].shdr;
    if shdr.sh_size == 0 {
        return None;
    }
    Some((shdr.sh_addr, shdr.sh_size))
}

/// Entries of `.dynamic`; the set is fixed before layout (so the size is
/// stable) but the values carry final addresses at copy time.
pub fn dynamic_entries(sess: &LinkSession) -> Vec<(u64, u64)> {
    let mut entries: Vec<(u64, u64)> = Vec::new();
    for &off in &sess.synth.needed_offs {
        entries.push((u64::from(elf::DT_NEEDED), u64::from(off)));
    }
    if let Some(off) = sess.synth.rpath_off {
        entries.push((u64::from(elf::DT_RUNPATH), u64::from(off)));
    }
    if let Some(off) = sess.synth.soname_off {
        entries.push((u64::from(elf::DT_SONAME), u64::from(off)));
    }
    if let Some((addr, size)) = section_by_name(sess, b".init_array") {
        entries.push((u64::from(elf::DT_INIT_ARRAY), addr));
        entries.push((u64::from(elf::DT_INIT_ARRAYSZ), size));
    }
    if let Some((addr, size)) = section_by_name(sess, b".fini_array") {
        entries.push((u64::from(elf::DT_FINI_ARRAY), addr));
        entries.push((u64::from(elf::DT_FINI_ARRAYSZ), size));
    }
    if let Some((addr, _)) = section_by_name(sess, b".init") {
        entries.push((u64::from(elf::DT_INIT), addr));
    }
    if let Some((addr, _)) = section_by_name(sess, b".fini") {
        entries.push((u64::from(elf::DT_FINI), addr));
    }
    if let Some((addr, _)) = chunk_pair(sess, sess.index.hash) {
        entries.push((u64::from(elf::DT_HASH), addr));
    }
    if let Some((addr, _)) = chunk_pair(sess, sess.index.gnu_hash) {
        entries.push((u64::from(elf::DT_GNU_HASH), addr));
    }
    if let Some((addr, size)) = chunk_pair(sess, sess.index.reldyn) {
        entries.push((u64::from(elf::DT_RELA), addr));
        entries.push((u64::from(elf::DT_RELASZ), size));
        entries.push((u64::from(elf::DT_RELAENT), 24));
    }
    if let Some((addr, size)) = chunk_pair(sess, sess.index.relplt) {
        entries.push((u64::from(elf::DT_JMPREL), addr));
        entries.push((u64::from(elf::DT_PLTRELSZ), size));
        entries.push((u64::from(elf::DT_PLTREL), u64::from(elf::DT_RELA)));
        entries.push((u64::from(elf::DT_PLTGOT), sess.gotplt_base()));
    }
    if let Some((addr, _)) = chunk_pair(sess, sess.index.dynsym) {
        entries.push((u64::from(elf::DT_SYMTAB), addr));
        entries.push((u64::from(elf::DT_SYMENT), 24));
    }
    if let Some((addr, size)) = chunk_pair(sess, sess.index.dynstr) {
        entries.push((u64::from(elf::DT_STRTAB), addr));
        entries.push((u64::from(elf::DT_STRSZ), size));
    }
    if let Some((addr, _)) = chunk_pair(sess, sess.index.versym) {
        entries.push((u64::from(elf::DT_VERSYM), addr));
    }
    if let Some((addr, _)) = chunk_pair(sess, sess.index.verneed) {
        entries.push((u64::from(elf::DT_VERNEED), addr));
        entries.push((u64::from(elf::DT_VERNEEDNUM), u64::from(sess.synth.verneed_count)));
    }
    if !sess.config.shared {
        entries.push((u64::from(elf::DT_DEBUG), 0));
    }
    entries.push((u64::from(elf::DT_NULL), 0));
    entries
}

/// The `.rela.dyn` contents: GLOB_DAT and RELATIVE for GOT slots, TPOFF64
/// and DTPMOD/DTPOFF for TLS slots, COPY for copy-relocated objects.
pub fn reldyn_entries(sess: &LinkSession) -> Vec<(u64, u32, u32, i64)> {
    let mut out = Vec::new();
    let mut slot = 0u32;
    for &(target, kind) in &sess.synth.got_entries {
        let addr = sess.got_slot_addr(slot);
        match kind {
            GotKind::Got => {
                match target {
                    SymSlot::Global(sym) => {
                        let (imported, dynsym) = (
                            sym.lock().is_imported,
                            Symbol::idx(&sym.dynsym_idx).unwrap_or(0),
                        );
                        if imported {
                            out.push((addr, elf::R_X86_64_GLOB_DAT, dynsym, 0));
                        } else if sess.config.shared || sess.config.pic {
                            out.push((
                                addr,
                                elf::R_X86_64_RELATIVE,
                                0,
                                sess.sym_addr(sym) as i64,
                            ));
                        }
                    }
                    SymSlot::Local(fid, idx) => {
                        if sess.config.shared || sess.config.pic {
                            let obj = sess.obj(fid);
                            let value = sess.local_sym_addr(obj, idx as usize) as i64;
                            out.push((addr, elf::R_X86_64_RELATIVE, 0, value));
                        }
                    }
                }
                slot += 1;
            }
            GotKind::GotTpoff => {
                if let SymSlot::Global(sym) = target {
                    if sym.lock().is_imported {
                        let dynsym = Symbol::idx(&sym.dynsym_idx).unwrap_or(0);
                        out.push((addr, elf::R_X86_64_TPOFF64, dynsym, 0));
                    }
                }
                slot += 1;
            }
            GotKind::TlsGd => {
                if let SymSlot::Global(sym) = target {
                    let dynsym = Symbol::idx(&sym.dynsym_idx).unwrap_or(0);
                    out.push((addr, elf::R_X86_64_DTPMOD64, dynsym, 0));
                    out.push((addr + 8, elf::R_X86_64_DTPOFF64, dynsym, 0));
                }
                slot += 2;
            }
            GotKind::TlsLd => {
                if sess.config.shared {
                    out.push((addr, elf::R_X86_64_DTPMOD64, 0, 0));
                }
                slot += 2;
            }
        }
    }
    for &sym in &sess.synth.copyrel_syms {
        let dynsym = Symbol::idx(&sym.dynsym_idx).unwrap_or(0);
        out.push((sess.sym_addr(sym), elf::R_X86_64_COPY, dynsym, 0));
    }
    out
}

fn relplt_entries(sess: &LinkSession) -> Vec<(u64, u32, u32, i64)> {
    let mut out = Vec::new();
    for (i, &target) in sess.synth.plt_syms.iter().enumerate() {
        let slot_addr = sess.gotplt_slot_addr(3 + i as u32);
        match target {
            SymSlot::Global(sym) => {
                let imported = sym.lock().is_imported;
                if imported {
                    let dynsym = Symbol::idx(&sym.dynsym_idx).unwrap_or(0);
                    out.push((slot_addr, elf::R_X86_64_JUMP_SLOT, dynsym, 0));
                } else {
                    // Non-imported PLT entries exist only for ifuncs.
                    out.push((slot_addr, elf::R_X86_64_IRELATIVE, 0, sess.sym_addr(sym) as i64));
                }
            }
            SymSlot::Local(fid, idx) => {
                let obj = sess.obj(fid);
                let value = sess.local_sym_addr(obj, idx as usize) as i64;
                out.push((slot_addr, elf::R_X86_64_IRELATIVE, 0, value));
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Program headers.

#[derive(Debug, Clone, Copy, Default)]
pub struct Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

pub fn create_phdrs(sess: &LinkSession) -> Vec<Phdr> {
    let mut phdrs = Vec::new();

    if let Some(i) = sess.index.interp {
        if let Some(p) = sess.index.phdr {
            let shdr = &sess.chunks[p].shdr;
            phdrs.push(Phdr {
                p_type: elf::PT_PHDR,
                p_flags: elf::PF_R,
                p_offset: shdr.sh_offset,
                p_vaddr: shdr.sh_addr,
                p_filesz: shdr.sh_size,
                p_memsz: shdr.sh_size,
                p_align: 8,
            });
        }
        let shdr = &sess.chunks[i].shdr;
        phdrs.push(Phdr {
            p_type: elf::PT_INTERP,
            p_flags: elf::PF_R,
            p_offset: shdr.sh_offset,
            p_vaddr: shdr.sh_addr,
            p_filesz: shdr.sh_size,
            p_memsz: shdr.sh_size,
            p_align: 1,
        });
    }

    // PT_LOAD runs over the allocated chunks.
    let mut cur: Option<Phdr> = None;
    for chunk in &sess.chunks {
        if chunk.shdr.sh_flags & u64::from(elf::SHF_ALLOC) == 0 {
            continue;
        }
        if chunk.starts_new_ptload {
            if let Some(p) = cur.take() {
                phdrs.push(p);
            }
            cur = Some(Phdr {
                p_type: elf::PT_LOAD,
                p_flags: crate::elf::to_phdr_flags(&chunk.shdr),
                p_offset: chunk.shdr.sh_offset,
                p_vaddr: chunk.shdr.sh_addr,
                p_filesz: 0,
                p_memsz: 0,
                p_align: crate::elf::PAGE_SIZE,
            });
        }
        if let Some(p) = cur.as_mut() {
            let end = chunk.shdr.sh_addr + chunk.shdr.sh_size;
            if end > p.p_vaddr {
                p.p_memsz = p.p_memsz.max(end - p.p_vaddr);
            }
            if chunk.shdr.sh_type != elf::SHT_NOBITS {
                p.p_filesz = chunk.shdr.sh_offset + chunk.shdr.sh_size - p.p_offset;
            }
        }
    }
    if let Some(p) = cur.take() {
        phdrs.push(p);
    }

    if let Some((_, _)) = chunk_pair(sess, sess.index.dynamic) {
        let shdr = &sess.chunks[sess.index.dynamic.unwrap()].shdr;
        phdrs.push(Phdr {
            p_type: elf::PT_DYNAMIC,
            p_flags: elf::PF_R | elf::PF_W,
            p_offset: shdr.sh_offset,
            p_vaddr: shdr.sh_addr,
            p_filesz: shdr.sh_size,
            p_memsz: shdr.sh_size,
            p_align: 8,
        });
    }

    if let Some(i) = sess.index.buildid {
        let shdr = &sess.chunks[i].shdr;
        phdrs.push(Phdr {
            p_type: elf::PT_NOTE,
            p_flags: elf::PF_R,
            p_offset: shdr.sh_offset,
            p_vaddr: shdr.sh_addr,
            p_filesz: shdr.sh_size,
            p_memsz: shdr.sh_size,
            p_align: 4,
        });
    }

    // PT_TLS spans the SHF_TLS chunks; .tbss overlaps what follows, so the
    // memory size extends past the file size.
    let tls: Vec<&OutChunk> = sess
        .chunks
        .iter()
        .filter(|c| c.shdr.sh_flags & u64::from(elf::SHF_TLS) != 0)
        .collect();
    if let Some(first) = tls.first() {
        let start = first.shdr.sh_addr;
        let mut filesz = 0;
        let mut memsz = 0;
        let mut align = 1;
        for chunk in &tls {
            memsz = memsz.max(chunk.shdr.sh_addr + chunk.shdr.sh_size - start);
            if chunk.shdr.sh_type != elf::SHT_NOBITS {
                filesz = filesz.max(chunk.shdr.sh_addr + chunk.shdr.sh_size - start);
            }
            align = align.max(chunk.shdr.sh_addralign);
        }
        phdrs.push(Phdr {
            p_type: elf::PT_TLS,
            p_flags: elf::PF_R,
            p_offset: first.shdr.sh_offset,
            p_vaddr: start,
            p_filesz: filesz,
            p_memsz: memsz,
            p_align: align,
        });
    }

    phdrs.push(Phdr { p_type: elf::PT_GNU_STACK, p_flags: elf::PF_R | elf::PF_W, ..Phdr::default() });
    phdrs
}

// ---------------------------------------------------------------------------
// Copying.

fn put16(out: &mut [u8], off: usize, v: u16) {
    out[off..off + 2].copy_from_slice(&v.to_le_bytes());
}
fn put32(out: &mut [u8], off: usize, v: u32) {
    out[off..off + 4].copy_from_slice(&v.to_le_bytes());
}
fn put64(out: &mut [u8], off: usize, v: u64) {
    out[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn put_sym(out: &mut [u8], off: usize, name: u32, info: u8, other: u8, shndx: u16, value: u64, size: u64) {
    put32(out, off, name);
    out[off + 4] = info;
    out[off + 5] = other;
    put16(out, off + 6, shndx);
    put64(out, off + 8, value);
    put64(out, off + 16, size);
}

fn put_rela(out: &mut [u8], off: usize, r_offset: u64, r_type: u32, r_sym: u32, addend: i64) {
    put64(out, off, r_offset);
    put64(out, off + 8, (u64::from(r_sym) << 32) | u64::from(r_type));
    put64(out, off + 16, addend as u64);
}

/// Splits `buf` into mutable windows at the given sorted, disjoint
/// (offset, len) ranges.
pub fn carve_mut<'a>(mut buf: &'a mut [u8], ranges: &[(u64, u64)]) -> Vec<&'a mut [u8]> {
    let mut out = Vec::with_capacity(ranges.len());
    let mut pos = 0u64;
    for &(off, len) in ranges {
        debug_assert!(off >= pos);
        let (_, rest) = buf.split_at_mut((off - pos) as usize);
        let (window, rest) = rest.split_at_mut(len as usize);
        out.push(window);
        buf = rest;
        pos = off + len;
    }
    out
}

/// Renders one chunk's bytes into its window of the output buffer.
pub fn copy_chunk(sess: &LinkSession, i: usize, out: &mut [u8]) {
    let chunk = &sess.chunks[i];
    match chunk.kind {
        ChunkKind::Ehdr => copy_ehdr(sess, out),
        ChunkKind::Phdr => {
            for (n, phdr) in create_phdrs(sess).iter().enumerate() {
                let raw = elf::ProgramHeader64::<LittleEndian> {
                    p_type: u32v(phdr.p_type),
                    p_flags: u32v(phdr.p_flags),
                    p_offset: u64v(phdr.p_offset),
                    p_vaddr: u64v(phdr.p_vaddr),
                    p_paddr: u64v(phdr.p_vaddr),
                    p_filesz: u64v(phdr.p_filesz),
                    p_memsz: u64v(phdr.p_memsz),
                    p_align: u64v(phdr.p_align),
                };
                out[n * 56..(n + 1) * 56].copy_from_slice(bytes_of(&raw));
            }
        }
        ChunkKind::Shdr => {
            for c in &sess.chunks {
                if c.is_header {
                    continue;
                }
                let s = &c.shdr;
                let raw = elf::SectionHeader64::<LittleEndian> {
                    sh_name: u32v(s.sh_name),
                    sh_type: u32v(s.sh_type),
                    sh_flags: u64v(s.sh_flags),
                    sh_addr: u64v(s.sh_addr),
                    sh_offset: u64v(s.sh_offset),
                    sh_size: u64v(s.sh_size),
                    sh_link: u32v(s.sh_link),
                    sh_info: u32v(s.sh_info),
                    sh_addralign: u64v(s.sh_addralign),
                    sh_entsize: u64v(s.sh_entsize),
                };
                let off = c.shndx as usize * 64;
                out[off..off + 64].copy_from_slice(bytes_of(&raw));
            }
        }
        ChunkKind::Interp => {
            let s = sess.config.dynamic_linker.as_bytes();
            out[..s.len()].copy_from_slice(s);
        }
        ChunkKind::Got => copy_got(sess, out),
        ChunkKind::GotPlt => copy_gotplt(sess, out),
        ChunkKind::Plt => copy_plt(sess, out),
        ChunkKind::PltGot => copy_pltgot(sess, out),
        ChunkKind::RelPlt => {
            for (n, &(off, ty, sym, addend)) in relplt_entries(sess).iter().enumerate() {
                put_rela(out, n * 24, off, ty, sym, addend);
            }
        }
        ChunkKind::RelDyn => {
            for (n, &(off, ty, sym, addend)) in reldyn_entries(sess).iter().enumerate() {
                put_rela(out, n * 24, off, ty, sym, addend);
            }
        }
        ChunkKind::Dynamic => {
            for (n, &(tag, val)) in dynamic_entries(sess).iter().enumerate() {
                put64(out, n * 16, tag);
                put64(out, n * 16 + 8, val);
            }
        }
        ChunkKind::Dynsym => copy_dynsym(sess, out),
        ChunkKind::Dynstr => {
            let bytes = sess.synth.dynstr.bytes();
            if bytes.is_empty() {
                out[0] = 0;
            } else {
                out[..bytes.len()].copy_from_slice(bytes);
            }
        }
        ChunkKind::Hash => copy_hash(sess, out),
        ChunkKind::GnuHash => copy_gnu_hash(sess, out),
        ChunkKind::Versym => {
            for (n, &v) in sess.synth.versym.iter().enumerate() {
                put16(out, n * 2, v);
            }
        }
        ChunkKind::Verneed => out[..sess.synth.verneed.len()]
            .copy_from_slice(&sess.synth.verneed),
        ChunkKind::Symtab => copy_symtab(sess, out),
        ChunkKind::Strtab => copy_strtab(sess, out),
        ChunkKind::Shstrtab => out[..sess.synth.shstrtab.len()]
            .copy_from_slice(&sess.synth.shstrtab),
        ChunkKind::BuildId => {
            // Note header; the digest itself is patched in after the whole
            // image is written.
            put32(out, 0, 4);
            put32(out, 4, sess.config.build_id.size() as u32);
            put32(out, 8, elf::NT_GNU_BUILD_ID);
            out[12..16].copy_from_slice(b"GNU\0");
        }
        ChunkKind::Copyrel | ChunkKind::CopyrelRelro => {}
        ChunkKind::Regular(id) => copy_regular(sess, id, out),
        ChunkKind::Merged(id) => copy_merged(sess, id, out),
    }
}

fn copy_ehdr(sess: &LinkSession, out: &mut [u8]) {
    let e_type = if sess.config.shared || sess.config.pic { elf::ET_DYN } else { elf::ET_EXEC };
    let ehdr = elf::FileHeader64::<LittleEndian> {
        e_ident: elf::Ident {
            magic: elf::ELFMAG,
            class: elf::ELFCLASS64,
            data: elf::ELFDATA2LSB,
            version: elf::EV_CURRENT,
            os_abi: elf::ELFOSABI_SYSV,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: u16v(e_type),
        e_machine: u16v(elf::EM_X86_64),
        e_version: u32v(u32::from(elf::EV_CURRENT)),
        e_entry: u64v(sess.entry_addr),
        e_phoff: u64v(sess.index.phdr.map(|i| sess.chunks[i].shdr.sh_offset).unwrap_or(0)),
        e_shoff: u64v(sess.index.shdr.map(|i| sess.chunks[i].shdr.sh_offset).unwrap_or(0)),
        e_flags: u32v(0),
        e_ehsize: u16v(64),
        e_phentsize: u16v(56),
        e_phnum: u16v(create_phdrs(sess).len() as u16),
        e_shentsize: u16v(64),
        e_shnum: u16v(non_header_count(sess) as u16 + 1),
        e_shstrndx: u16v(shndx_of(sess, sess.index.shstrtab) as u16),
    };
    out[..64].copy_from_slice(bytes_of(&ehdr));
}

fn slot_value(sess: &LinkSession, target: SymSlot) -> u64 {
    match target {
        SymSlot::Global(sym) => sess.sym_addr(sym),
        SymSlot::Local(fid, idx) => sess.local_sym_addr(sess.obj(fid), idx as usize),
    }
}

fn copy_got(sess: &LinkSession, out: &mut [u8]) {
    let mut slot = 0usize;
    for &(target, kind) in &sess.synth.got_entries {
        match kind {
            GotKind::Got => {
                let imported = match target {
                    SymSlot::Global(sym) => sym.lock().is_imported,
                    SymSlot::Local(..) => false,
                };
                // Imported slots stay zero for GLOB_DAT to fill.
                let value = if imported { 0 } else { slot_value(sess, target) };
                put64(out, slot * 8, value);
                slot += 1;
            }
            GotKind::GotTpoff => {
                let imported = match target {
                    SymSlot::Global(sym) => sym.lock().is_imported,
                    SymSlot::Local(..) => false,
                };
                let value = if imported {
                    0
                } else {
                    slot_value(sess, target).wrapping_sub(sess.tls_end)
                };
                put64(out, slot * 8, value);
                slot += 1;
            }
            GotKind::TlsGd => {
                put64(out, slot * 8, 0);
                put64(out, slot * 8 + 8, 0);
                slot += 2;
            }
            GotKind::TlsLd => {
                // Module id 1 is the executable itself; a shared library
                // leaves it for the DTPMOD relocation.
                put64(out, slot * 8, if sess.config.shared { 0 } else { 1 });
                put64(out, slot * 8 + 8, 0);
                slot += 2;
            }
        }
    }
}

fn copy_gotplt(sess: &LinkSession, out: &mut [u8]) {
    if sess.synth.plt_syms.is_empty() {
        return;
    }
    put64(out, 0, sess.chunk_addr(sess.index.dynamic));
    // Slots 1 and 2 are for the dynamic loader.
    for i in 0..sess.synth.plt_syms.len() {
        // Lazy binding starts each slot at the push instruction of its PLT
        // entry.
        put64(out, (3 + i) * 8, sess.plt_entry_addr(i as u32) + 6);
    }
}

fn copy_plt(sess: &LinkSession, out: &mut [u8]) {
    if sess.synth.plt_syms.is_empty() {
        return;
    }
    let plt = sess.chunk_addr(sess.index.plt);
    let gotplt = sess.gotplt_base();

    // pushq GOTPLT+8(%rip); jmpq *GOTPLT+16(%rip); nop
    out[0] = 0xff;
    out[1] = 0x35;
    put32(out, 2, (gotplt + 8).wrapping_sub(plt + 6) as u32);
    out[6] = 0xff;
    out[7] = 0x25;
    put32(out, 8, (gotplt + 16).wrapping_sub(plt + 12) as u32);
    out[12..16].copy_from_slice(&[0x0f, 0x1f, 0x40, 0x00]);

    for i in 0..sess.synth.plt_syms.len() {
        let base = (PLT_HDR_SIZE + i as u64 * PLT_ENTRY_SIZE) as usize;
        let ent_addr = sess.plt_entry_addr(i as u32);
        let slot_addr = sess.gotplt_slot_addr(3 + i as u32);
        out[base] = 0xff;
        out[base + 1] = 0x25;
        put32(out, base + 2, slot_addr.wrapping_sub(ent_addr + 6) as u32);
        out[base + 6] = 0x68; // pushq imm32
        put32(out, base + 7, i as u32);
        out[base + 11] = 0xe9; // jmp plt[0]
        put32(out, base + 12, plt.wrapping_sub(ent_addr + 16) as u32);
    }
}

fn copy_pltgot(sess: &LinkSession, out: &mut [u8]) {
    for (i, &target) in sess.synth.pltgot_syms.iter().enumerate() {
        let got_idx = match target {
            SymSlot::Global(sym) => Symbol::idx(&sym.got_idx).unwrap_or(0),
            SymSlot::Local(fid, idx) => {
                let v = sess.obj(fid).local_state[idx as usize].got_idx.load(Ordering::Relaxed);
                v.max(0) as u32
            }
        };
        let ent_addr = sess.pltgot_entry_addr(i as u32);
        let base = i * 8;
        out[base] = 0xff;
        out[base + 1] = 0x25;
        put32(out, base + 2, sess.got_slot_addr(got_idx).wrapping_sub(ent_addr + 6) as u32);
        out[base + 6] = 0x66;
        out[base + 7] = 0x90;
    }
}

fn copy_dynsym(sess: &LinkSession, out: &mut [u8]) {
    for &sym in &sess.synth.dynsyms {
        let idx = sym.dynsym_idx.load(Ordering::Relaxed);
        if idx <= 0 {
            continue;
        }
        let (info, other, esize) = {
            let st = sym.lock();
            let info = (st.binding << 4) | (st.sym_type & 0xf);
            (info, st.visibility, st.esize)
        };
        let (shndx, value) = if sess.sym_is_undef_in_output(sym) {
            (elf::SHN_UNDEF, 0)
        } else {
            (sess.sym_shndx(sym), sess.sym_def_addr(sym))
        };
        put_sym(
            out,
            idx as usize * 24,
            sess.synth.dynstr.lookup(sym.name),
            info,
            other,
            shndx,
            value,
            esize,
        );
    }
}

fn copy_hash(sess: &LinkSession, out: &mut [u8]) {
    let n = sess.synth.dynsyms.len() + 1;
    let nbucket = n as u32;
    put32(out, 0, nbucket);
    put32(out, 4, n as u32);
    let buckets_off = 8usize;
    let chain_off = buckets_off + nbucket as usize * 4;
    for &sym in &sess.synth.dynsyms {
        let idx = sym.dynsym_idx.load(Ordering::Relaxed);
        if idx <= 0 {
            continue;
        }
        let h = elf_hash(sym.name) % nbucket;
        let head_off = buckets_off + h as usize * 4;
        let head = u32::from_le_bytes(out[head_off..head_off + 4].try_into().unwrap());
        put32(out, chain_off + idx as usize * 4, head);
        put32(out, head_off, idx as u32);
    }
}

const GNU_HASH_BLOOM_SHIFT: u32 = 26;

fn copy_gnu_hash(sess: &LinkSession, out: &mut [u8]) {
    let nbuckets = sess.synth.gnu_nbuckets.max(1);
    let symndx = sess.synth.dynsym_symndx;
    put32(out, 0, nbuckets);
    put32(out, 4, symndx);
    put32(out, 8, 1); // bloom words
    put32(out, 12, GNU_HASH_BLOOM_SHIFT);

    let bloom_off = 16usize;
    let buckets_off = bloom_off + 8;
    let chain_off = buckets_off + nbuckets as usize * 4;

    let mut bloom = 0u64;
    let hashed = &sess.synth.dynsyms[symndx as usize - 1..];
    for (i, &sym) in hashed.iter().enumerate() {
        let h = gnu_hash(sym.name);
        bloom |= 1u64 << (h % 64);
        bloom |= 1u64 << ((h >> GNU_HASH_BLOOM_SHIFT) % 64);

        let bucket = h % nbuckets;
        let bucket_off = buckets_off + bucket as usize * 4;
        if u32::from_le_bytes(out[bucket_off..bucket_off + 4].try_into().unwrap()) == 0 {
            put32(out, bucket_off, symndx + i as u32);
        }
        // Chain value: hash with the low bit marking end-of-bucket.
        let last =
            i + 1 == hashed.len() || gnu_hash(hashed[i + 1].name) % nbuckets != bucket;
        put32(out, chain_off + i * 4, (h & !1) | u32::from(last));
    }
    put64(out, bloom_off, bloom);
}

fn copy_symtab(sess: &LinkSession, out: &mut [u8]) {
    // Entry 0 is the null symbol: 24 bytes already zeroed.
    for &id in &sess.objs {
        let obj = sess.obj(id);
        let plan = obj.symtab_plan;

        let mut off = plan.local_symtab_off as usize;
        let mut name_off = plan.local_strtab_off as u32;
        for (idx, esym) in obj.symtab_locals() {
            let value = sess.local_sym_addr(obj, idx);
            let shndx = local_shndx(sess, obj, esym);
            put_sym(out, off, name_off, esym.info, esym.other, shndx, value, esym.size);
            name_off += esym.name.len() as u32 + 1;
            off += 24;
        }

        let mut off = plan.global_symtab_off as usize;
        let mut name_off = plan.global_strtab_off as u32;
        for sym in obj.symtab_globals(id) {
            let (info, other, esize) = {
                let st = sym.lock();
                ((st.binding << 4) | (st.sym_type & 0xf), st.visibility, st.esize)
            };
            let shndx = sess.sym_shndx(sym);
            let value = sess.sym_def_addr(sym);
            put_sym(out, off, name_off, info, other, shndx, value, esize);
            name_off += sym.name.len() as u32 + 1;
            off += 24;
        }
    }
}

fn local_shndx(sess: &LinkSession, obj: &InputObject, esym: &crate::obj::ESym) -> u16 {
    if esym.is_abs() {
        return elf::SHN_ABS;
    }
    match obj.sections.get(esym.shndx as usize) {
        Some(SectionSlot::Regular(isec)) if isec.is_alive() => {
            let chunk = sess.index.osec_chunks[isec.osec as usize];
            chunk.map(|i| sess.chunks[i].shndx as u16).unwrap_or(0)
        }
        Some(SectionSlot::Merged(local)) => {
            let merged = obj.mergeable[*local as usize].merged;
            let chunk = sess.index.merged_chunks[merged as usize];
            chunk.map(|i| sess.chunks[i].shndx as u16).unwrap_or(0)
        }
        _ => 0,
    }
}

fn copy_strtab(sess: &LinkSession, out: &mut [u8]) {
    for &id in &sess.objs {
        let obj = sess.obj(id);
        let plan = obj.symtab_plan;

        let mut off = plan.local_strtab_off as usize;
        for (_, esym) in obj.symtab_locals() {
            out[off..off + esym.name.len()].copy_from_slice(esym.name);
            off += esym.name.len() + 1;
        }
        let mut off = plan.global_strtab_off as usize;
        for sym in obj.symtab_globals(id) {
            out[off..off + sym.name.len()].copy_from_slice(sym.name);
            off += sym.name.len() + 1;
        }
    }
}

fn copy_regular(sess: &LinkSession, id: u32, out: &mut [u8]) {
    let def = &sess.osecs.defs[id as usize];
    let mut jobs: Vec<((u64, u64), (FileId, u32))> = Vec::with_capacity(def.members.len());
    for &(fid, shndx) in &def.members {
        let obj = sess.obj(fid);
        let SectionSlot::Regular(isec) = &obj.sections[shndx as usize] else { continue };
        jobs.push(((isec.offset.load(Ordering::Relaxed), isec.size), (fid, shndx)));
    }
    let ranges: Vec<(u64, u64)> = jobs.iter().map(|&(range, _)| range).collect();
    let windows = carve_mut(out, &ranges);
    windows
        .into_par_iter()
        .zip(jobs.par_iter())
        .for_each(|(window, &(_, (fid, shndx)))| {
            let obj = sess.obj(fid);
            let SectionSlot::Regular(isec) = &obj.sections[shndx as usize] else { return };
            crate::reloc::copy_isec(sess, obj, isec, window);
        });
}

fn copy_merged(sess: &LinkSession, id: u32, out: &mut [u8]) {
    let def = &sess.merged.defs[id as usize];
    for bucket in &def.buckets {
        for piece in &bucket.pieces {
            if piece.owner_ordinal().is_none() {
                continue;
            }
            let off = piece.offset() as usize;
            out[off..off + piece.data.len()].copy_from_slice(piece.data);
        }
    }
}
