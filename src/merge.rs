//! Mergeable string deduplication.
//!
//! Sections flagged SHF_MERGE|SHF_STRINGS with an entry size of one byte
//! are split into null-terminated pieces. Identical pieces from any input
//! file collapse to a single `StringPiece`, interned by content into the
//! matching `MergedSection` (one per output name/flags/type). Each piece is
//! then claimed by the mergeable section of the lowest-priority file that
//! contributed it, the winner lays out the pieces it owns, and a final
//! serial pass assigns every mergeable section its offset inside the merged
//! output section.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use fxhash::FxHashMap;
use rayon::prelude::*;

use crate::elf::align_to;
use crate::layout::get_output_name;
use crate::obj::SectionSlot;
use crate::session::{Counters, InputFile, LinkSession};

const MERGE_BUCKETS: usize = 32;
const NO_OWNER: u64 = u64::MAX;

/// Stable handle to an interned string piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceRef {
    pub merged: u32,
    pub bucket: u32,
    pub idx: u32,
}

pub struct StringPiece {
    pub data: &'static [u8],
    /// (owner file priority << 32) | owning mergeable-section ordinal.
    owner: AtomicU64,
    /// Offset within the owning section, later within the merged section.
    /// -1 until the owner lays the piece out.
    offset: AtomicI64,
    align: AtomicU64,
    pub is_alive: AtomicBool,
}

impl StringPiece {
    fn new(data: &'static [u8], align: u64) -> StringPiece {
        StringPiece {
            data,
            owner: AtomicU64::new(NO_OWNER),
            offset: AtomicI64::new(-1),
            align: AtomicU64::new(align),
            is_alive: AtomicBool::new(true),
        }
    }

    /// Claims the piece for (priority, ordinal) if that priority is lower
    /// than the current owner's, retrying the compare-and-swap until the
    /// ownership is consistent.
    pub fn claim(&self, priority: u32, ordinal: u32) {
        let packed = (u64::from(priority) << 32) | u64::from(ordinal);
        let mut cur = self.owner.load(Ordering::Relaxed);
        while packed < cur {
            match self
                .owner
                .compare_exchange_weak(cur, packed, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(seen) => cur = seen,
            }
        }
    }

    pub fn owner_ordinal(&self) -> Option<u32> {
        let v = self.owner.load(Ordering::Relaxed);
        (v != NO_OWNER).then_some(v as u32)
    }

    pub fn align(&self) -> u64 {
        self.align.load(Ordering::Relaxed)
    }

    pub fn offset(&self) -> u64 {
        let v = self.offset.load(Ordering::Relaxed);
        debug_assert!(v >= 0);
        v as u64
    }

    fn offset_raw(&self) -> i64 {
        self.offset.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct PieceBucket {
    map: FxHashMap<&'static [u8], u32>,
    pub pieces: Vec<StringPiece>,
}

pub struct MergedSectionDef {
    pub name: &'static [u8],
    pub sh_type: u32,
    pub sh_flags: u64,
    intern: Vec<Mutex<PieceBucket>>,
    pub buckets: Vec<PieceBucket>,
    pub size: u64,
    pub addralign: u64,
}

impl MergedSectionDef {
    fn new(name: &'static [u8], sh_type: u32, sh_flags: u64) -> MergedSectionDef {
        MergedSectionDef {
            name,
            sh_type,
            sh_flags,
            intern: (0..MERGE_BUCKETS).map(|_| Mutex::new(PieceBucket::default())).collect(),
            buckets: Vec::new(),
            size: 0,
            addralign: 1,
        }
    }

    /// Interns one null-terminated piece; the piece's alignment is the max
    /// requested across all contributing sections.
    fn intern(&self, id: u32, data: &'static [u8], align: u64) -> PieceRef {
        let bucket_idx = fxhash::hash64(data) as usize % MERGE_BUCKETS;
        let mut bucket = self.intern[bucket_idx].lock().unwrap();
        let idx = match bucket.map.get(data).copied() {
            Some(idx) => idx,
            None => {
                let idx = bucket.pieces.len() as u32;
                bucket.pieces.push(StringPiece::new(data, align));
                bucket.map.insert(data, idx);
                idx
            }
        };
        bucket.pieces[idx as usize].align.fetch_max(align, Ordering::Relaxed);
        PieceRef { merged: id, bucket: bucket_idx as u32, idx }
    }

    fn finalize_intern(&mut self) {
        self.buckets = self
            .intern
            .drain(..)
            .map(|bucket| bucket.into_inner().unwrap())
            .collect();
    }
}

#[derive(Default)]
pub struct MergedRegistry {
    map: FxHashMap<(&'static [u8], u64, u32), u32>,
    pub defs: Vec<MergedSectionDef>,
}

impl MergedRegistry {
    pub fn get_or_create(&mut self, name: &'static [u8], sh_type: u32, sh_flags: u64) -> u32 {
        let name = get_output_name(name);
        let defs = &mut self.defs;
        *self.map.entry((name, sh_flags, sh_type)).or_insert_with(|| {
            defs.push(MergedSectionDef::new(name, sh_type, sh_flags));
            (defs.len() - 1) as u32
        })
    }

    pub fn piece(&self, r: PieceRef) -> &StringPiece {
        &self.defs[r.merged as usize].buckets[r.bucket as usize].pieces[r.idx as usize]
    }
}

/// A reference from a mergeable section into the piece pool.
#[derive(Debug, Clone, Copy)]
pub struct Frag {
    pub input_off: u32,
    pub piece: PieceRef,
}

/// Registers every mergeable input section with the merged-section
/// registry and gives it a global ordinal. Serial, in file order, so
/// ordinals and registry ids are deterministic.
pub fn register_merged_sections(sess: &mut LinkSession) {
    let LinkSession { files, objs, merged, msec_index, .. } = sess;
    for &id in objs.iter() {
        if let InputFile::Obj(obj) = &mut files[id as usize] {
            for (local, msec) in obj.mergeable.iter_mut().enumerate() {
                msec.merged = merged.get_or_create(msec.name, msec.sh_type, msec.sh_flags);
                msec.ordinal = msec_index.len() as u32;
                msec_index.push((id, local as u32));
            }
        }
    }
}

#[tracing::instrument(skip_all, name = "Merge strings")]
pub fn handle_mergeable_strings(sess: &mut LinkSession) -> Result<()> {
    split_and_intern(sess)?;
    for def in &mut sess.merged.defs {
        def.finalize_intern();
    }
    claim_owners(sess);
    layout_owned_pieces(sess);
    assign_parent_offsets(sess);
    finalize_piece_offsets(sess);
    bind_string_pieces(sess);
    sess.errors.checkpoint()
}

/// Splits each mergeable payload into null-terminated pieces and interns
/// them. Parallel over mergeable sections; insertions synchronize on the
/// per-bucket locks inside the registry.
fn split_and_intern(sess: &mut LinkSession) -> Result<()> {
    let results: Vec<Result<Vec<Frag>, String>> = {
        let files = &sess.files;
        let merged = &sess.merged;
        sess.msec_index
            .par_iter()
            .map(|&(fid, local)| {
                let InputFile::Obj(obj) = &files[fid as usize] else { unreachable!() };
                let msec = &obj.mergeable[local as usize];
                let mut frags = Vec::new();
                let mut rest = msec.data;
                let mut off = 0u32;
                while !rest.is_empty() {
                    let Some(end) = memchr::memchr(0, rest) else {
                        return Err(format!(
                            "{}:({}): string is not null terminated",
                            obj.name,
                            String::from_utf8_lossy(msec.name)
                        ));
                    };
                    let (piece, tail) = rest.split_at(end + 1);
                    let r =
                        merged.defs[msec.merged as usize].intern(msec.merged, piece, msec.addralign);
                    frags.push(Frag { input_off: off, piece: r });
                    off += piece.len() as u32;
                    rest = tail;
                }
                Ok(frags)
            })
            .collect()
    };

    let mut npieces = 0u64;
    for (ordinal, result) in results.into_iter().enumerate() {
        match result {
            Ok(frags) => {
                npieces += frags.len() as u64;
                let (fid, local) = sess.msec_index[ordinal];
                let InputFile::Obj(obj) = &mut sess.files[fid as usize] else { unreachable!() };
                obj.mergeable[local as usize].frags = frags;
            }
            Err(msg) => sess.errors.report(msg),
        }
    }
    Counters::add(&sess.counters.string_pieces, npieces);
    Ok(())
}

/// Every mergeable section tries to claim each of its pieces; the CAS in
/// `StringPiece::claim` leaves the lowest-priority contributor as owner.
fn claim_owners(sess: &LinkSession) {
    let LinkSession { files, merged, msec_index, .. } = sess;
    msec_index.par_iter().for_each(|&(fid, local)| {
        let InputFile::Obj(obj) = &files[fid as usize] else { unreachable!() };
        let msec = &obj.mergeable[local as usize];
        for frag in &msec.frags {
            let piece = merged.piece(frag.piece);
            if piece.is_alive.load(Ordering::Relaxed) {
                piece.claim(obj.priority, msec.ordinal);
            }
        }
    });
}

/// Each winning section lays out the pieces it owns sequentially with
/// alignment. Only the owner writes a given piece, so the stores race with
/// nothing.
fn layout_owned_pieces(sess: &mut LinkSession) {
    let sizes: Vec<u64> = {
        let files = &sess.files;
        let merged = &sess.merged;
        sess.msec_index
            .par_iter()
            .map(|&(fid, local)| {
                let InputFile::Obj(obj) = &files[fid as usize] else { unreachable!() };
                let msec = &obj.mergeable[local as usize];
                let mut off = 0u64;
                for frag in &msec.frags {
                    let piece = merged.piece(frag.piece);
                    if piece.owner_ordinal() == Some(msec.ordinal) && piece.offset_raw() == -1 {
                        off = align_to(off, piece.align());
                        piece.offset.store(off as i64, Ordering::Relaxed);
                        off += piece.data.len() as u64;
                    }
                }
                off
            })
            .collect()
    };

    for (ordinal, size) in sizes.into_iter().enumerate() {
        let (fid, local) = sess.msec_index[ordinal];
        let InputFile::Obj(obj) = &mut sess.files[fid as usize] else { unreachable!() };
        obj.mergeable[local as usize].size = size;
    }
}

/// Serial pass: each mergeable section gets an offset within its merged
/// parent, padding for alignment; the parent's alignment is the max of its
/// inputs.
fn assign_parent_offsets(sess: &mut LinkSession) {
    let LinkSession { files, merged, msec_index, .. } = sess;
    for &(fid, local) in msec_index.iter() {
        let InputFile::Obj(obj) = &mut files[fid as usize] else { unreachable!() };
        let msec = &mut obj.mergeable[local as usize];
        let parent = &mut merged.defs[msec.merged as usize];
        let offset = parent.size;
        msec.padding = align_to(offset, msec.addralign) - offset;
        msec.offset = offset + msec.padding;
        parent.size = msec.offset + msec.size;
        parent.addralign = parent.addralign.max(msec.addralign);
    }
}

/// Folds the owning section's parent offset into each piece so a piece's
/// final position is just `merged_section_addr + piece.offset()`.
fn finalize_piece_offsets(sess: &LinkSession) {
    let LinkSession { files, merged, msec_index, .. } = sess;
    merged.defs.par_iter().for_each(|def| {
        for bucket in &def.buckets {
            for piece in &bucket.pieces {
                if piece.offset_raw() < 0 {
                    continue;
                }
                let Some(ordinal) = piece.owner_ordinal() else { continue };
                let (fid, local) = msec_index[ordinal as usize];
                let InputFile::Obj(obj) = &files[fid as usize] else { unreachable!() };
                let base = obj.mergeable[local as usize].offset;
                piece.offset.fetch_add(base as i64, Ordering::Relaxed);
            }
        }
    });
}

/// Connects symbols and relocations to the pieces they land in: global
/// symbols defined inside a mergeable section get a `PieceRef` in their
/// state, and each relocation whose target is a local symbol in a mergeable
/// section gets a per-relocation piece ref carrying the rebased addend.
fn bind_string_pieces(sess: &mut LinkSession) {
    let LinkSession { files, merged, errors, .. } = sess;
    let merged: &MergedRegistry = merged;
    let errors: &crate::session::ErrorSink = errors;

    files.par_iter_mut().for_each(|file| {
        let InputFile::Obj(obj) = file else { return };
        if !obj.is_alive.load(Ordering::Relaxed) || obj.esyms.is_empty() {
            return;
        }

        // Returns the piece containing byte `base` of section `shndx`, and
        // the piece's starting offset within the section. None if the
        // section is not mergeable or the offset points past its payload.
        let lookup = |shndx: u16, base: u64| -> Option<(PieceRef, u64)> {
            let SectionSlot::Merged(local) = obj.sections.get(shndx as usize)? else {
                return None;
            };
            let msec = &obj.mergeable[*local as usize];
            let i = msec.frags.partition_point(|f| u64::from(f.input_off) <= base);
            let frag = &msec.frags[i.checked_sub(1)?];
            let piece = merged.piece(frag.piece);
            if base >= u64::from(frag.input_off) + piece.data.len() as u64 {
                return None;
            }
            Some((frag.piece, u64::from(frag.input_off)))
        };

        // Global symbols defined in mergeable sections.
        for (slot, sym) in obj.globals.iter().enumerate() {
            let esym = &obj.esyms[obj.first_global + slot];
            if esym.is_undef() || esym.is_abs() || esym.is_common() {
                continue;
            }
            let mut st = sym.lock();
            if st.file == obj.id as i32 && st.sec == i32::from(esym.shndx) {
                if let Some((piece, frag_off)) = lookup(esym.shndx, esym.value) {
                    st.piece = Some(piece);
                    st.value = esym.value - frag_off;
                }
            }
        }

        // Per-relocation refs for local symbols. For a named symbol the
        // piece is selected by st_value alone and the addend applies after;
        // for an anonymous section symbol the addend selects the piece.
        // Either way the stored addend is value + addend - piece_start.
        let mut computed: Vec<(usize, Vec<(u32, PieceRef, i64)>)> = Vec::new();
        for (si, slot) in obj.sections.iter().enumerate() {
            let SectionSlot::Regular(isec) = slot else { continue };
            if isec.rels.is_empty() || !isec.is_alive() {
                continue;
            }
            let mut refs = Vec::new();
            for (ri, rel) in isec.rels.iter().enumerate() {
                let (sym_idx, _) = crate::obj::rel_split(rel);
                if sym_idx == 0 || sym_idx as usize >= obj.first_global {
                    continue;
                }
                let esym = &obj.esyms[sym_idx as usize];
                if esym.is_undef() || esym.is_abs() {
                    continue;
                }
                if !matches!(obj.sections.get(esym.shndx as usize), Some(SectionSlot::Merged(_))) {
                    continue;
                }
                let addend = crate::obj::rel_addend(rel);
                let base = if esym.st_type() == object::elf::STT_SECTION {
                    esym.value.wrapping_add(addend as u64)
                } else {
                    esym.value
                };
                match lookup(esym.shndx, base) {
                    Some((piece, frag_off)) => {
                        let full = esym.value as i64 + addend - frag_off as i64;
                        refs.push((ri as u32, piece, full));
                    }
                    None => errors.report(format!(
                        "{}: relocation offset {:#x} outside mergeable section",
                        obj.name, base
                    )),
                }
            }
            if !refs.is_empty() {
                computed.push((si, refs));
            }
        }
        for (si, refs) in computed {
            let SectionSlot::Regular(isec) = &mut obj.sections[si] else { unreachable!() };
            isec.rel_pieces = refs;
        }
    });
}
