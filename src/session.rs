//! Link session state.
//!
//! All state that survives across pipeline stages hangs off one
//! `LinkSession` value threaded through the stages: the parsed input files,
//! the symbol interner, the output-section registries, the ordered chunk
//! list, counters, and the deferred-error sink. Parallel stages take the
//! session by shared reference and rely on the atomics and per-symbol
//! mutexes inside; serial stages take it mutably.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};

use crate::chunks::{ChunkKind, OutChunk};
use crate::config::Config;
use crate::dso::SharedObject;
use crate::layout::OutputSecRegistry;
use crate::merge::{MergedRegistry, PieceRef};
use crate::obj::{ComdatRegistry, InputObject, SectionSlot};
use crate::symbol::{FileId, SymRef, Symbol, SymbolTable, FILE_NONE, SEC_NONE};

pub const PLT_HDR_SIZE: u64 = 16;
pub const PLT_ENTRY_SIZE: u64 = 16;
pub const PLTGOT_ENTRY_SIZE: u64 = 8;
pub const GOT_ENTRY_SIZE: u64 = 8;

pub enum InputFile {
    Obj(InputObject),
    Dso(SharedObject),
}

impl InputFile {
    pub fn name(&self) -> &str {
        match self {
            InputFile::Obj(o) => &o.name,
            InputFile::Dso(d) => &d.name,
        }
    }

    pub fn priority(&self) -> u32 {
        match self {
            InputFile::Obj(o) => o.priority,
            InputFile::Dso(d) => d.priority,
        }
    }

    pub fn is_alive(&self) -> bool {
        match self {
            InputFile::Obj(o) => o.is_alive.load(Ordering::Relaxed),
            InputFile::Dso(d) => d.is_alive.load(Ordering::Relaxed),
        }
    }

    pub fn is_dso(&self) -> bool {
        matches!(self, InputFile::Dso(_))
    }
}

/// Per-item diagnostics are recorded here and flushed at the next
/// checkpoint, so one pass can report every problem it finds instead of
/// stopping at the first.
#[derive(Default)]
pub struct ErrorSink {
    errors: Mutex<Vec<String>>,
}

impl ErrorSink {
    pub fn report(&self, msg: String) {
        self.errors.lock().unwrap().push(msg);
    }

    pub fn checkpoint(&self) -> Result<()> {
        let mut errors = self.errors.lock().unwrap();
        if errors.is_empty() {
            return Ok(());
        }
        errors.sort();
        errors.dedup();
        bail!("{}", errors.join("\n"));
    }
}

#[derive(Default)]
pub struct Counters {
    pub defined_syms: AtomicU64,
    pub undefined_syms: AtomicU64,
    pub input_sections: AtomicU64,
    pub output_chunks: AtomicU64,
    pub string_pieces: AtomicU64,
    pub relocs: AtomicU64,
}

impl Counters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn print(&self) {
        println!("defined_syms={}", self.defined_syms.load(Ordering::Relaxed));
        println!("undefined_syms={}", self.undefined_syms.load(Ordering::Relaxed));
        println!("input_sections={}", self.input_sections.load(Ordering::Relaxed));
        println!("output_chunks={}", self.output_chunks.load(Ordering::Relaxed));
        println!("string_pieces={}", self.string_pieces.load(Ordering::Relaxed));
        println!("relocs={}", self.relocs.load(Ordering::Relaxed));
    }
}

/// Positions of well-known chunks within `LinkSession::chunks`, rebuilt by
/// `reindex_chunks` whenever the chunk list is reordered or pruned.
#[derive(Default)]
pub struct ChunkIndex {
    pub ehdr: Option<usize>,
    pub phdr: Option<usize>,
    pub shdr: Option<usize>,
    pub interp: Option<usize>,
    pub got: Option<usize>,
    pub gotplt: Option<usize>,
    pub plt: Option<usize>,
    pub pltgot: Option<usize>,
    pub relplt: Option<usize>,
    pub reldyn: Option<usize>,
    pub dynamic: Option<usize>,
    pub dynsym: Option<usize>,
    pub dynstr: Option<usize>,
    pub hash: Option<usize>,
    pub gnu_hash: Option<usize>,
    pub versym: Option<usize>,
    pub verneed: Option<usize>,
    pub symtab: Option<usize>,
    pub strtab: Option<usize>,
    pub shstrtab: Option<usize>,
    pub copyrel: Option<usize>,
    pub copyrel_relro: Option<usize>,
    pub buildid: Option<usize>,
    pub osec_chunks: Vec<Option<usize>>,
    pub merged_chunks: Vec<Option<usize>>,
}

pub struct LinkSession {
    pub config: Config,
    pub symbols: SymbolTable,
    pub files: Vec<InputFile>,
    /// Live object files, in input order. Erased in place when liveness
    /// propagation drops archive members.
    pub objs: Vec<FileId>,
    pub dsos: Vec<FileId>,
    pub internal: FileId,
    pub osecs: OutputSecRegistry,
    pub merged: MergedRegistry,
    pub comdats: ComdatRegistry,
    /// Global mergeable-section ordinal → (file, local index).
    pub msec_index: Vec<(FileId, u32)>,
    pub chunks: Vec<OutChunk>,
    pub synth: crate::chunks::Synthetics,
    pub index: ChunkIndex,
    pub counters: Counters,
    pub errors: ErrorSink,
    pub tls_begin: u64,
    pub tls_end: u64,
    pub entry_addr: u64,
    pub filesize: u64,
}

impl LinkSession {
    pub fn new(config: Config) -> LinkSession {
        LinkSession {
            config,
            symbols: SymbolTable::default(),
            files: Vec::new(),
            objs: Vec::new(),
            dsos: Vec::new(),
            internal: 0,
            osecs: OutputSecRegistry::default(),
            merged: MergedRegistry::default(),
            comdats: ComdatRegistry::default(),
            msec_index: Vec::new(),
            chunks: Vec::new(),
            synth: crate::chunks::Synthetics::default(),
            index: ChunkIndex::default(),
            counters: Counters::default(),
            errors: ErrorSink::default(),
            tls_begin: 0,
            tls_end: 0,
            entry_addr: 0,
            filesize: 0,
        }
    }

    pub fn obj(&self, id: FileId) -> &InputObject {
        match &self.files[id as usize] {
            InputFile::Obj(o) => o,
            InputFile::Dso(_) => panic!("file {} is a shared object", id),
        }
    }

    pub fn obj_mut(&mut self, id: FileId) -> &mut InputObject {
        match &mut self.files[id as usize] {
            InputFile::Obj(o) => o,
            InputFile::Dso(_) => panic!("file {} is a shared object", id),
        }
    }

    pub fn dso(&self, id: FileId) -> &SharedObject {
        match &self.files[id as usize] {
            InputFile::Dso(d) => d,
            InputFile::Obj(_) => panic!("file {} is an object", id),
        }
    }

    /// Interns a symbol name that does not borrow from an input file.
    pub fn intern_str(&self, name: &str) -> SymRef {
        self.symbols.intern(leak_bytes(name.as_bytes()))
    }

    pub fn chunk_addr(&self, idx: Option<usize>) -> u64 {
        idx.map(|i| self.chunks[i].shdr.sh_addr).unwrap_or(0)
    }

    pub fn got_base(&self) -> u64 {
        self.chunk_addr(self.index.got)
    }

    pub fn gotplt_base(&self) -> u64 {
        self.chunk_addr(self.index.gotplt)
    }

    pub fn got_slot_addr(&self, idx: u32) -> u64 {
        self.got_base() + u64::from(idx) * GOT_ENTRY_SIZE
    }

    pub fn gotplt_slot_addr(&self, idx: u32) -> u64 {
        self.gotplt_base() + u64::from(idx) * GOT_ENTRY_SIZE
    }

    pub fn plt_entry_addr(&self, idx: u32) -> u64 {
        self.chunk_addr(self.index.plt) + PLT_HDR_SIZE + u64::from(idx) * PLT_ENTRY_SIZE
    }

    pub fn pltgot_entry_addr(&self, idx: u32) -> u64 {
        self.chunk_addr(self.index.pltgot) + u64::from(idx) * PLTGOT_ENTRY_SIZE
    }

    /// The address a PLT-calling relocation should target, or None if the
    /// symbol got no PLT entry.
    pub fn plt_addr(&self, sym: &Symbol) -> Option<u64> {
        if let Some(idx) = Symbol::idx(&sym.pltgot_idx) {
            return Some(self.pltgot_entry_addr(idx));
        }
        Symbol::idx(&sym.plt_idx).map(|idx| self.plt_entry_addr(idx))
    }

    pub fn piece_addr(&self, piece: PieceRef) -> u64 {
        let base = self.chunk_addr(self.index.merged_chunks[piece.merged as usize]);
        base + self.merged.piece(piece).offset()
    }

    /// Resolved address of a global symbol. 0 for undefined symbols and for
    /// imports that got neither a PLT entry nor a copy relocation.
    pub fn sym_addr(&self, sym: &Symbol) -> u64 {
        let st = sym.lock();
        if st.has_copyrel {
            let chunk = if st.is_readonly { self.index.copyrel_relro } else { self.index.copyrel };
            return self.chunk_addr(chunk) + st.value;
        }
        if let Some(piece) = st.piece {
            return self.piece_addr(piece) + st.value;
        }
        if st.is_imported {
            drop(st);
            return self.plt_addr(sym).unwrap_or(0);
        }
        if st.file == FILE_NONE {
            return 0;
        }
        if st.sec == SEC_NONE {
            return st.value;
        }
        let obj = self.obj(st.file as u32);
        match &obj.sections[st.sec as usize] {
            SectionSlot::Regular(isec) if isec.is_alive() => {
                self.isec_addr(isec) + st.value
            }
            _ => 0,
        }
    }

    /// Address of a symbol's definition, ignoring whether references bind
    /// through the PLT: this is what symbol-table entries record.
    pub fn sym_def_addr(&self, sym: &Symbol) -> u64 {
        let st = sym.lock();
        if st.has_copyrel {
            let chunk = if st.is_readonly { self.index.copyrel_relro } else { self.index.copyrel };
            return self.chunk_addr(chunk) + st.value;
        }
        if let Some(piece) = st.piece {
            return self.piece_addr(piece) + st.value;
        }
        if st.file == FILE_NONE {
            return 0;
        }
        if st.sec == SEC_NONE {
            return st.value;
        }
        if self.files[st.file as usize].is_dso() {
            return 0;
        }
        let obj = self.obj(st.file as u32);
        match &obj.sections[st.sec as usize] {
            SectionSlot::Regular(isec) if isec.is_alive() => self.isec_addr(isec) + st.value,
            _ => 0,
        }
    }

    /// True if the output symbol tables should show `sym` as undefined:
    /// nobody defined it, its definition lives in a shared object, or it is
    /// an import claimed only to satisfy a shared-library link.
    pub fn sym_is_undef_in_output(&self, sym: &Symbol) -> bool {
        let st = sym.lock();
        if st.has_copyrel {
            return false;
        }
        if st.file == FILE_NONE {
            return true;
        }
        self.files[st.file as usize].is_dso()
            || (st.is_imported && st.sec == SEC_NONE && st.piece.is_none())
    }

    /// Output address of a regular input section.
    pub fn isec_addr(&self, isec: &crate::obj::InputSection) -> u64 {
        let chunk = self.index.osec_chunks[isec.osec as usize];
        self.chunk_addr(chunk) + isec.offset.load(Ordering::Relaxed)
    }

    /// Resolved address of a local symbol of `obj`.
    pub fn local_sym_addr(&self, obj: &InputObject, idx: usize) -> u64 {
        let Some(esym) = obj.esyms.get(idx) else {
            return 0;
        };
        if esym.is_abs() {
            return esym.value;
        }
        if esym.is_undef() {
            return 0;
        }
        match &obj.sections[esym.shndx as usize] {
            SectionSlot::Regular(isec) if isec.is_alive() => self.isec_addr(isec) + esym.value,
            // Locals in mergeable sections are reached through per-reloc
            // string piece refs; a direct query lands here only for dead
            // sections.
            _ => 0,
        }
    }

    /// The output section index recorded in symbol-table entries for `sym`.
    pub fn sym_shndx(&self, sym: &Symbol) -> u16 {
        if self.sym_is_undef_in_output(sym) {
            return object::elf::SHN_UNDEF;
        }
        let st = sym.lock();
        if st.has_copyrel {
            let chunk = if st.is_readonly { self.index.copyrel_relro } else { self.index.copyrel };
            return chunk.map(|i| self.chunks[i].shndx as u16).unwrap_or(0);
        }
        if let Some(piece) = st.piece {
            let chunk = self.index.merged_chunks[piece.merged as usize];
            return chunk.map(|i| self.chunks[i].shndx as u16).unwrap_or(0);
        }
        if st.sec == SEC_NONE {
            if st.out_shndx != 0 {
                return st.out_shndx as u16;
            }
            return object::elf::SHN_ABS;
        }
        let obj = self.obj(st.file as u32);
        match &obj.sections[st.sec as usize] {
            SectionSlot::Regular(isec) if isec.is_alive() => {
                let chunk = self.index.osec_chunks[isec.osec as usize];
                chunk.map(|i| self.chunks[i].shndx as u16).unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// Rebuilds the well-known chunk index after the chunk list changes.
    pub fn reindex_chunks(&mut self) {
        let mut index = ChunkIndex {
            osec_chunks: vec![None; self.osecs.defs.len()],
            merged_chunks: vec![None; self.merged.defs.len()],
            ..ChunkIndex::default()
        };
        for (i, chunk) in self.chunks.iter().enumerate() {
            match chunk.kind {
                ChunkKind::Ehdr => index.ehdr = Some(i),
                ChunkKind::Phdr => index.phdr = Some(i),
                ChunkKind::Shdr => index.shdr = Some(i),
                ChunkKind::Interp => index.interp = Some(i),
                ChunkKind::Got => index.got = Some(i),
                ChunkKind::GotPlt => index.gotplt = Some(i),
                ChunkKind::Plt => index.plt = Some(i),
                ChunkKind::PltGot => index.pltgot = Some(i),
                ChunkKind::RelPlt => index.relplt = Some(i),
                ChunkKind::RelDyn => index.reldyn = Some(i),
                ChunkKind::Dynamic => index.dynamic = Some(i),
                ChunkKind::Dynsym => index.dynsym = Some(i),
                ChunkKind::Dynstr => index.dynstr = Some(i),
                ChunkKind::Hash => index.hash = Some(i),
                ChunkKind::GnuHash => index.gnu_hash = Some(i),
                ChunkKind::Versym => index.versym = Some(i),
                ChunkKind::Verneed => index.verneed = Some(i),
                ChunkKind::Symtab => index.symtab = Some(i),
                ChunkKind::Strtab => index.strtab = Some(i),
                ChunkKind::Shstrtab => index.shstrtab = Some(i),
                ChunkKind::Copyrel => index.copyrel = Some(i),
                ChunkKind::CopyrelRelro => index.copyrel_relro = Some(i),
                ChunkKind::BuildId => index.buildid = Some(i),
                ChunkKind::Regular(id) => index.osec_chunks[id as usize] = Some(i),
                ChunkKind::Merged(id) => index.merged_chunks[id as usize] = Some(i),
            }
        }
        self.index = index;
    }
}

/// Input data, symbol names, and parsed files all live for the whole link,
/// so one-off strings that need to join them are simply leaked.
pub fn leak_bytes(bytes: &[u8]) -> &'static [u8] {
    Box::leak(bytes.to_vec().into_boxed_slice())
}
