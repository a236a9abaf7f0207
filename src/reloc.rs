//! Relocation scanning and application.
//!
//! The scanner classifies every relocation in allocated sections to decide
//! which symbols need GOT slots, PLT entries, copy relocations, or dynamic
//! TLS state; a serial aggregation pass then turns the accumulated need
//! flags into concrete table indices. The applier copies section bytes
//! into the output image and patches them with the System V x86-64
//! relocation formulas, relaxing general-dynamic and local-dynamic TLS
//! sequences to local-exec where the symbol never got a dynamic slot.
//!
//! Reference: <https://refspecs.linuxbase.org/elf/x86_64-abi-0.99.pdf>

use std::sync::atomic::Ordering;

use anyhow::Result;
use object::elf;
use rayon::prelude::*;

use crate::obj::{rel_addend, rel_offset, rel_split, InputObject, InputSection, SectionSlot};
use crate::session::{Counters, InputFile, LinkSession};
use crate::symbol::{
    FileId, SymRef, Symbol, NEEDS_COPYREL, NEEDS_DYNSYM, NEEDS_GOT, NEEDS_GOTTPOFF, NEEDS_PLT,
    NEEDS_TLSGD, NEEDS_TLSLD,
};

/// A relocation target: an interned global, or a local symbol of one file.
#[derive(Clone, Copy)]
pub enum SymSlot {
    Global(SymRef),
    Local(FileId, u32),
}

/// What a GOT slot (or pair of slots) holds.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum GotKind {
    /// One address slot.
    Got,
    /// One slot holding the thread-pointer offset.
    GotTpoff,
    /// Two slots: module id and dtv offset, for general-dynamic TLS.
    TlsGd,
    /// Two slots shared by all local-dynamic TLS, module id and zero.
    TlsLd,
}

/// mov %fs:0,%rax; lea x@tpoff(%rax),%rax. Replaces a TLSGD sequence.
const TLSGD_TO_LE: [u8; 16] = [
    0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, 0x48, 0x8d, 0x80, 0, 0, 0, 0,
];

/// mov %fs:0,%rax with prefix padding. Replaces a TLSLD sequence.
const TLSLD_TO_LE: [u8; 12] = [
    0x66, 0x66, 0x66, 0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0,
];

#[tracing::instrument(skip_all, name = "Scan relocations")]
pub fn scan_rels(sess: &LinkSession) -> Result<()> {
    sess.objs.par_iter().for_each(|&id| scan_file(sess, sess.obj(id)));
    sess.errors.checkpoint()
}

fn scan_file(sess: &LinkSession, obj: &InputObject) {
    let mut nrels = 0u64;
    for slot in &obj.sections {
        let SectionSlot::Regular(isec) = slot else { continue };
        if !isec.is_alive() || isec.sh_flags & u64::from(elf::SHF_ALLOC) == 0 {
            continue;
        }
        nrels += isec.rels.len() as u64;

        let mut i = 0usize;
        while i < isec.rels.len() {
            let rel = &isec.rels[i];
            let (sym_idx, r_type) = rel_split(rel);
            let paired_plt32 = matches!(
                isec.rels.get(i + 1).map(rel_split),
                Some((_, elf::R_X86_64_PLT32))
            );

            if sym_idx as usize >= obj.esyms.len() && sym_idx != 0 {
                obj.has_error.store(true, Ordering::Relaxed);
                sess.errors.report(format!(
                    "{}:({}): relocation against invalid symbol index {}",
                    obj.name,
                    String::from_utf8_lossy(isec.name),
                    sym_idx
                ));
                i += 1;
                continue;
            }
            if (sym_idx as usize) < obj.first_global || obj.esyms.is_empty() {
                i += scan_one_local(sess, obj, isec, sym_idx, r_type, paired_plt32);
            } else {
                let sym = obj.global_sym(sym_idx as usize);
                i += scan_one_global(sess, obj, isec, sym, r_type, paired_plt32);
            }
            i += 1;
        }
    }
    Counters::add(&sess.counters.relocs, nrels);
}

/// Scans one relocation against a global symbol. Returns how many extra
/// relocations to skip (1 when a TLS pair collapses).
fn scan_one_global(
    sess: &LinkSession,
    obj: &InputObject,
    isec: &InputSection,
    sym: SymRef,
    r_type: u32,
    paired_plt32: bool,
) -> usize {
    let (undefined, imported, sym_type) = {
        let st = sym.lock();
        (st.file == crate::symbol::FILE_NONE || st.placeholder, st.is_imported, st.sym_type)
    };
    if r_type == elf::R_X86_64_NONE {
        return 0;
    }
    if undefined {
        obj.has_error.store(true, Ordering::Relaxed);
        sess.errors.report(format!(
            "undefined symbol: {}: {}",
            obj.name,
            sym.name_str()
        ));
        return 0;
    }

    match r_type {
        elf::R_X86_64_8
        | elf::R_X86_64_16
        | elf::R_X86_64_32
        | elf::R_X86_64_32S
        | elf::R_X86_64_64
        | elf::R_X86_64_PC8
        | elf::R_X86_64_PC16
        | elf::R_X86_64_PC32
        | elf::R_X86_64_PC64 => {
            if imported {
                if sym_type == elf::STT_OBJECT {
                    sym.add_flags(NEEDS_COPYREL);
                } else {
                    sym.add_flags(NEEDS_PLT);
                }
            }
        }
        elf::R_X86_64_GOT32
        | elf::R_X86_64_GOTPC32
        | elf::R_X86_64_GOTPCREL
        | elf::R_X86_64_GOTPCRELX
        | elf::R_X86_64_REX_GOTPCRELX => sym.add_flags(NEEDS_GOT),
        elf::R_X86_64_PLT32 => {
            if imported || sym_type == elf::STT_GNU_IFUNC {
                sym.add_flags(NEEDS_PLT);
            }
        }
        elf::R_X86_64_TLSGD => {
            if !paired_plt32 {
                obj.has_error.store(true, Ordering::Relaxed);
                sess.errors.report(format!(
                    "{}:({}): TLSGD relocation not followed by PLT32",
                    obj.name,
                    String::from_utf8_lossy(isec.name)
                ));
                return 0;
            }
            if imported {
                sym.add_flags(NEEDS_TLSGD);
            } else {
                return 1;
            }
        }
        elf::R_X86_64_TLSLD => {
            if !paired_plt32 {
                obj.has_error.store(true, Ordering::Relaxed);
                sess.errors.report(format!(
                    "{}:({}): TLSLD relocation not followed by PLT32",
                    obj.name,
                    String::from_utf8_lossy(isec.name)
                ));
                return 0;
            }
            if imported {
                sym.add_flags(NEEDS_TLSLD);
            } else {
                return 1;
            }
        }
        elf::R_X86_64_TPOFF32
        | elf::R_X86_64_TPOFF64
        | elf::R_X86_64_DTPOFF32
        | elf::R_X86_64_DTPOFF64 => {}
        elf::R_X86_64_GOTTPOFF => sym.add_flags(NEEDS_GOTTPOFF),
        other => {
            obj.has_error.store(true, Ordering::Relaxed);
            sess.errors.report(format!(
                "{}:({}): unknown relocation: {}",
                obj.name,
                String::from_utf8_lossy(isec.name),
                other
            ));
        }
    }
    0
}

fn scan_one_local(
    sess: &LinkSession,
    obj: &InputObject,
    isec: &InputSection,
    sym_idx: u32,
    r_type: u32,
    paired_plt32: bool,
) -> usize {
    let Some(local) = obj.local_state.get(sym_idx as usize) else {
        return 0;
    };
    match r_type {
        elf::R_X86_64_GOT32
        | elf::R_X86_64_GOTPC32
        | elf::R_X86_64_GOTPCREL
        | elf::R_X86_64_GOTPCRELX
        | elf::R_X86_64_REX_GOTPCRELX => {
            local.flags.fetch_or(NEEDS_GOT, Ordering::Relaxed);
        }
        elf::R_X86_64_PLT32 => {
            let is_ifunc = obj
                .esyms
                .get(sym_idx as usize)
                .is_some_and(|esym| esym.st_type() == elf::STT_GNU_IFUNC);
            if is_ifunc {
                local.flags.fetch_or(NEEDS_PLT, Ordering::Relaxed);
            }
        }
        elf::R_X86_64_GOTTPOFF => {
            local.flags.fetch_or(NEEDS_GOTTPOFF, Ordering::Relaxed);
        }
        // Local general/local-dynamic TLS always relaxes to local-exec.
        elf::R_X86_64_TLSGD | elf::R_X86_64_TLSLD => {
            if !paired_plt32 {
                obj.has_error.store(true, Ordering::Relaxed);
                sess.errors.report(format!(
                    "{}:({}): TLS relocation not followed by PLT32",
                    obj.name,
                    String::from_utf8_lossy(isec.name)
                ));
                return 0;
            }
            return 1;
        }
        elf::R_X86_64_NONE
        | elf::R_X86_64_8
        | elf::R_X86_64_16
        | elf::R_X86_64_32
        | elf::R_X86_64_32S
        | elf::R_X86_64_64
        | elf::R_X86_64_PC8
        | elf::R_X86_64_PC16
        | elf::R_X86_64_PC32
        | elf::R_X86_64_PC64
        | elf::R_X86_64_TPOFF32
        | elf::R_X86_64_TPOFF64
        | elf::R_X86_64_DTPOFF32
        | elf::R_X86_64_DTPOFF64 => {}
        other => {
            obj.has_error.store(true, Ordering::Relaxed);
            sess.errors.report(format!(
                "{}:({}): unknown relocation: {}",
                obj.name,
                String::from_utf8_lossy(isec.name),
                other
            ));
        }
    }
    0
}

/// Serial pass after scanning: aggregate the NEEDS_* bits into table
/// assignments, walking files in input order so every index is
/// deterministic.
#[tracing::instrument(skip_all, name = "Assign table slots")]
pub fn assign_table_slots(sess: &mut LinkSession) {
    // Definitions that shared objects reference must be exported.
    for &id in &sess.dsos {
        let dso = sess.dso(id);
        for &sym in &dso.undefs {
            let mut st = sym.lock();
            if st.file >= 0 && !sess.files[st.file as usize].is_dso() {
                st.is_exported = true;
                drop(st);
                sym.add_flags(NEEDS_DYNSYM);
            }
        }
    }

    let mut got_idx: u32 = 0;
    let order: Vec<FileId> = sess.objs.iter().chain(sess.dsos.iter()).copied().collect();

    for fid in order {
        // Local symbols first: GOT and ifunc-PLT slots only.
        if let InputFile::Obj(obj) = &sess.files[fid as usize] {
            for (i, local) in obj.local_state.iter().enumerate() {
                let flags = local.flags.load(Ordering::Relaxed);
                if flags == 0 {
                    continue;
                }
                if flags & NEEDS_GOT != 0 && local.got_idx.load(Ordering::Relaxed) < 0 {
                    local.got_idx.store(got_idx as i32, Ordering::Relaxed);
                    sess.synth.got_entries.push((SymSlot::Local(fid, i as u32), GotKind::Got));
                    got_idx += 1;
                }
                if flags & NEEDS_GOTTPOFF != 0 && local.gottpoff_idx.load(Ordering::Relaxed) < 0 {
                    local.gottpoff_idx.store(got_idx as i32, Ordering::Relaxed);
                    sess.synth
                        .got_entries
                        .push((SymSlot::Local(fid, i as u32), GotKind::GotTpoff));
                    got_idx += 1;
                }
                if flags & NEEDS_PLT != 0 && local.plt_idx.load(Ordering::Relaxed) < 0 {
                    local.plt_idx.store(sess.synth.plt_syms.len() as i32, Ordering::Relaxed);
                    sess.synth.plt_syms.push(SymSlot::Local(fid, i as u32));
                }
            }
        }

        let globals: Vec<SymRef> = match &sess.files[fid as usize] {
            InputFile::Obj(obj) => obj.globals.clone(),
            InputFile::Dso(dso) => dso.symbols.clone(),
        };
        for sym in globals {
            let (owned, imported) = {
                let st = sym.lock();
                (st.file == fid as i32, st.is_imported)
            };
            if !owned {
                continue;
            }
            let mut flags = sym.get_flags();
            if imported && flags != 0 {
                sym.add_flags(NEEDS_DYNSYM);
                flags |= NEEDS_DYNSYM;
            }
            if flags == 0 {
                continue;
            }

            if flags & NEEDS_DYNSYM != 0 {
                add_dynsym(sess, sym);
            }
            if flags & NEEDS_GOT != 0 && sym.got_idx.load(Ordering::Relaxed) < 0 {
                sym.got_idx.store(got_idx as i32, Ordering::Relaxed);
                sess.synth.got_entries.push((SymSlot::Global(sym), GotKind::Got));
                got_idx += 1;
            }
            if flags & NEEDS_PLT != 0
                && sym.plt_idx.load(Ordering::Relaxed) < 0
                && sym.pltgot_idx.load(Ordering::Relaxed) < 0
            {
                if flags & NEEDS_GOT != 0 {
                    sym.pltgot_idx
                        .store(sess.synth.pltgot_syms.len() as i32, Ordering::Relaxed);
                    sess.synth.pltgot_syms.push(SymSlot::Global(sym));
                } else {
                    sym.plt_idx.store(sess.synth.plt_syms.len() as i32, Ordering::Relaxed);
                    sess.synth.plt_syms.push(SymSlot::Global(sym));
                }
            }
            if flags & NEEDS_GOTTPOFF != 0 && sym.gottpoff_idx.load(Ordering::Relaxed) < 0 {
                sym.gottpoff_idx.store(got_idx as i32, Ordering::Relaxed);
                sess.synth.got_entries.push((SymSlot::Global(sym), GotKind::GotTpoff));
                got_idx += 1;
            }
            if flags & NEEDS_TLSGD != 0 && sym.tlsgd_idx.load(Ordering::Relaxed) < 0 {
                sym.tlsgd_idx.store(got_idx as i32, Ordering::Relaxed);
                sess.synth.got_entries.push((SymSlot::Global(sym), GotKind::TlsGd));
                got_idx += 2;
            }
            if flags & NEEDS_TLSLD != 0 && sym.tlsld_idx.load(Ordering::Relaxed) < 0 {
                let idx = match sess.synth.tlsld_idx {
                    Some(idx) => idx,
                    None => {
                        let idx = got_idx;
                        sess.synth.tlsld_idx = Some(idx);
                        sess.synth.got_entries.push((SymSlot::Global(sym), GotKind::TlsLd));
                        got_idx += 2;
                        idx
                    }
                };
                sym.tlsld_idx.store(idx as i32, Ordering::Relaxed);
            }
            if flags & NEEDS_COPYREL != 0 {
                add_copyrel(sess, fid, sym);
            }
        }
    }
    sess.synth.num_got_slots = got_idx;
}

fn add_dynsym(sess: &mut LinkSession, sym: SymRef) {
    if sym.dynsym_idx.load(Ordering::Relaxed) >= 0 {
        return;
    }
    // Provisional index; the real order is fixed when .dynsym is sorted.
    sym.dynsym_idx.store(sess.synth.dynsyms.len() as i32, Ordering::Relaxed);
    sess.synth.dynstr.add(sym.name);
    sess.synth.dynsyms.push(sym);
}

/// Allocates space in .bss (or .bss.rel.ro when the DSO keeps the datum in
/// read-only memory) for a copy relocation, and exports every alias the
/// defining DSO has at the same address.
fn add_copyrel(sess: &mut LinkSession, fid: FileId, sym: SymRef) {
    let (already, value, esize) = {
        let st = sym.lock();
        (st.has_copyrel, st.value, st.esize)
    };
    if already {
        return;
    }
    let InputFile::Dso(dso) = &sess.files[fid as usize] else { return };
    let readonly = dso.is_readonly(value);
    let aliases = dso.find_aliases(value, sym);

    let size_slot = if readonly {
        &mut sess.synth.copyrel_relro_size
    } else {
        &mut sess.synth.copyrel_size
    };
    let offset = crate::elf::align_to(*size_slot, 64);
    *size_slot = offset + esize.max(1);

    {
        let mut st = sym.lock();
        st.has_copyrel = true;
        st.is_readonly = readonly;
        st.value = offset;
    }
    sess.synth.copyrel_syms.push(sym);

    for alias in aliases {
        {
            let mut st = alias.lock();
            if st.file != fid as i32 {
                continue;
            }
            st.has_copyrel = true;
            st.is_readonly = readonly;
            st.value = offset;
        }
        alias.add_flags(NEEDS_DYNSYM);
        add_dynsym(sess, alias);
    }
}

// ---------------------------------------------------------------------------
// Application.

struct Patcher<'a> {
    out: &'a mut [u8],
    obj_name: &'a str,
    errors: &'a crate::session::ErrorSink,
}

impl Patcher<'_> {
    fn write(&mut self, off: u64, width: usize, value: u64) {
        let off = off as usize;
        if off + width > self.out.len() {
            self.errors.report(format!(
                "{}: relocation write out of range at {:#x}",
                self.obj_name, off
            ));
            return;
        }
        self.out[off..off + width].copy_from_slice(&value.to_le_bytes()[..width]);
    }

    fn splice(&mut self, off: i64, bytes: &[u8]) -> bool {
        if off < 0 || off as usize + bytes.len() > self.out.len() {
            self.errors.report(format!(
                "{}: TLS relaxation write out of range at {:#x}",
                self.obj_name, off
            ));
            return false;
        }
        self.out[off as usize..off as usize + bytes.len()].copy_from_slice(bytes);
        true
    }
}

/// Copies one input section into its place in the output buffer and
/// applies its relocations.
pub fn copy_isec(sess: &LinkSession, obj: &InputObject, isec: &InputSection, out: &mut [u8]) {
    let n = isec.data.len().min(out.len());
    out[..n].copy_from_slice(&isec.data[..n]);

    let base = sess.isec_addr(isec);
    let mut patcher = Patcher { out, obj_name: &obj.name, errors: &sess.errors };
    let mut piece_cursor = 0usize;

    let mut i = 0usize;
    while i < isec.rels.len() {
        let rel = &isec.rels[i];
        let (sym_idx, r_type) = rel_split(rel);
        let off = rel_offset(rel);
        let p = base + off;

        // Per-relocation string piece ref, if any.
        while piece_cursor < isec.rel_pieces.len() && isec.rel_pieces[piece_cursor].0 < i as u32 {
            piece_cursor += 1;
        }
        let piece = isec
            .rel_pieces
            .get(piece_cursor)
            .filter(|entry| entry.0 == i as u32)
            .map(|&(_, piece, addend)| (piece, addend));

        let target = if (sym_idx as usize) < obj.first_global
            || sym_idx as usize >= obj.esyms.len()
        {
            SymSlot::Local(obj.id, sym_idx)
        } else {
            SymSlot::Global(obj.global_sym(sym_idx as usize))
        };

        // Skip relocations against symbols nobody defined; the resolver
        // already reported them.
        if let SymSlot::Global(sym) = target {
            if r_type != elf::R_X86_64_NONE && sym.lock().file == crate::symbol::FILE_NONE {
                i += 1;
                continue;
            }
        }

        let (s, a) = match piece {
            Some((piece, addend)) => (sess.piece_addr(piece), addend),
            None => (slot_addr(sess, obj, target), rel_addend(rel)),
        };

        i += apply_one(sess, obj, &mut patcher, target, r_type, off, p, s, a);
        i += 1;
    }
}

fn slot_addr(sess: &LinkSession, obj: &InputObject, target: SymSlot) -> u64 {
    match target {
        SymSlot::Global(sym) => sess.sym_addr(sym),
        SymSlot::Local(_, idx) => sess.local_sym_addr(obj, idx as usize),
    }
}

fn slot_got_idx(obj: &InputObject, target: SymSlot) -> Option<u32> {
    match target {
        SymSlot::Global(sym) => Symbol::idx(&sym.got_idx),
        SymSlot::Local(_, idx) => {
            let v = obj.local_state.get(idx as usize)?.got_idx.load(Ordering::Relaxed);
            (v >= 0).then_some(v as u32)
        }
    }
}

fn slot_gottpoff_idx(obj: &InputObject, target: SymSlot) -> Option<u32> {
    match target {
        SymSlot::Global(sym) => Symbol::idx(&sym.gottpoff_idx),
        SymSlot::Local(_, idx) => {
            let v = obj.local_state.get(idx as usize)?.gottpoff_idx.load(Ordering::Relaxed);
            (v >= 0).then_some(v as u32)
        }
    }
}

fn slot_plt_addr(sess: &LinkSession, obj: &InputObject, target: SymSlot) -> Option<u64> {
    match target {
        SymSlot::Global(sym) => sess.plt_addr(sym),
        SymSlot::Local(_, idx) => {
            let v = obj.local_state.get(idx as usize)?.plt_idx.load(Ordering::Relaxed);
            (v >= 0).then(|| sess.plt_entry_addr(v as u32))
        }
    }
}

/// Applies one relocation; returns how many following relocations to skip.
#[allow(clippy::too_many_arguments)]
fn apply_one(
    sess: &LinkSession,
    obj: &InputObject,
    patcher: &mut Patcher<'_>,
    target: SymSlot,
    r_type: u32,
    off: u64,
    p: u64,
    s: u64,
    a: i64,
) -> usize {
    let got = sess.got_base();
    let v = |x: i64| x as u64;

    match r_type {
        elf::R_X86_64_NONE => {}
        elf::R_X86_64_64 => patcher.write(off, 8, v(s as i64 + a)),
        elf::R_X86_64_PC32 => patcher.write(off, 4, v(s as i64 + a - p as i64)),
        elf::R_X86_64_GOT32 => match slot_got_idx(obj, target) {
            Some(idx) => patcher.write(off, 8, v(u64::from(idx) as i64 * 8 + a)),
            None => patcher.errors.report(missing_got(obj, target)),
        },
        elf::R_X86_64_PLT32 => {
            let l = slot_plt_addr(sess, obj, target).unwrap_or(s);
            patcher.write(off, 4, v(l as i64 + a - p as i64));
        }
        elf::R_X86_64_GOTPCREL | elf::R_X86_64_GOTPCRELX | elf::R_X86_64_REX_GOTPCRELX => {
            match slot_got_idx(obj, target) {
                Some(idx) => {
                    patcher.write(off, 4, v(sess.got_slot_addr(idx) as i64 + a - p as i64))
                }
                None => patcher.errors.report(missing_got(obj, target)),
            }
        }
        elf::R_X86_64_32 | elf::R_X86_64_32S => patcher.write(off, 4, v(s as i64 + a)),
        elf::R_X86_64_16 => patcher.write(off, 2, v(s as i64 + a)),
        elf::R_X86_64_PC16 => patcher.write(off, 2, v(s as i64 + a - p as i64)),
        elf::R_X86_64_8 => patcher.write(off, 1, v(s as i64 + a)),
        elf::R_X86_64_PC8 => patcher.write(off, 1, v(s as i64 + a - p as i64)),
        elf::R_X86_64_TLSGD => {
            let idx = match target {
                SymSlot::Global(sym) => Symbol::idx(&sym.tlsgd_idx),
                SymSlot::Local(..) => None,
            };
            match idx {
                None => {
                    // Relax general-dynamic to local-exec: the call to
                    // __tls_get_addr and its setup collapse into two moves.
                    if patcher.splice(off as i64 - 4, &TLSGD_TO_LE) {
                        let tpoff = s as i64 - sess.tls_end as i64 + a + 4;
                        patcher.write(off + 8, 4, tpoff as u64);
                    }
                    return 1;
                }
                Some(idx) => {
                    patcher.write(off, 4, v(sess.got_slot_addr(idx) as i64 + a - p as i64))
                }
            }
        }
        elf::R_X86_64_TLSLD => {
            let idx = match target {
                SymSlot::Global(sym) => Symbol::idx(&sym.tlsld_idx),
                SymSlot::Local(..) => None,
            };
            match idx {
                None => {
                    patcher.splice(off as i64 - 3, &TLSLD_TO_LE);
                    return 1;
                }
                Some(idx) => {
                    patcher.write(off, 4, v(sess.got_slot_addr(idx) as i64 + a - p as i64))
                }
            }
        }
        elf::R_X86_64_DTPOFF32 | elf::R_X86_64_TPOFF32 => {
            patcher.write(off, 4, v(s as i64 + a - sess.tls_end as i64));
        }
        elf::R_X86_64_DTPOFF64 | elf::R_X86_64_TPOFF64 => {
            patcher.write(off, 8, v(s as i64 + a - sess.tls_end as i64));
        }
        elf::R_X86_64_GOTTPOFF => match slot_gottpoff_idx(obj, target) {
            Some(idx) => patcher.write(off, 4, v(sess.got_slot_addr(idx) as i64 + a - p as i64)),
            None => patcher.errors.report(missing_got(obj, target)),
        },
        elf::R_X86_64_PC64 => patcher.write(off, 8, v(s as i64 + a - p as i64)),
        elf::R_X86_64_GOTPC32 => patcher.write(off, 4, v(got as i64 + a - p as i64)),
        // Unknown types were recorded by the scanner; write nothing.
        _ => {}
    }
    0
}

fn missing_got(obj: &InputObject, target: SymSlot) -> String {
    let name = match target {
        SymSlot::Global(sym) => sym.name_str().into_owned(),
        SymSlot::Local(_, idx) => format!("local symbol {}", idx),
    };
    format!("{}: missing GOT entry for: {}", obj.name, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relax_sequences_match_abi() {
        // mov %fs:0,%rax is 64 48 8b 04 25 00 00 00 00 in both sequences.
        assert_eq!(&TLSGD_TO_LE[..5], &[0x64, 0x48, 0x8b, 0x04, 0x25]);
        assert_eq!(&TLSGD_TO_LE[9..12], &[0x48, 0x8d, 0x80]);
        assert_eq!(TLSGD_TO_LE.len(), 16);
        assert_eq!(TLSLD_TO_LE.len(), 12);
        assert_eq!(&TLSLD_TO_LE[..4], &[0x66, 0x66, 0x66, 0x64]);
    }
}
