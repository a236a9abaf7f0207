//! Symbol resolution and file liveness.
//!
//! Phase A publishes every defined global into the shared table under the
//! (strength, priority) election. Phase B walks references from the root
//! set, waking dormant archive members exactly once via compare-and-swap,
//! then erases files that never became live.

use std::sync::atomic::Ordering;

use anyhow::Result;
use rayon::prelude::*;

use crate::obj::SectionSlot;
use crate::session::{InputFile, LinkSession};
use crate::symbol::{FileId, SymState, FILE_NONE, NEEDS_DYNSYM};

#[tracing::instrument(skip_all, name = "Resolve symbols")]
pub fn resolve_symbols(sess: &mut LinkSession) {
    // Phase A: definition publication.
    sess.files.par_iter().for_each(|file| match file {
        InputFile::Obj(obj) => obj.resolve_symbols(),
        InputFile::Dso(dso) => dso.resolve_symbols(),
    });

    // Roots: every non-archive object, plus files defining --undefined
    // symbols.
    let mut roots: Vec<FileId> = sess
        .objs
        .iter()
        .copied()
        .filter(|&id| sess.files[id as usize].is_alive())
        .collect();

    for name in &sess.config.undefined {
        let sym = sess.intern_str(name);
        let st = sym.lock();
        if st.file == FILE_NONE {
            continue;
        }
        let target = st.file as u32;
        drop(st);
        match &sess.files[target as usize] {
            InputFile::Obj(obj) => {
                if !obj.is_alive.swap(true, Ordering::SeqCst) {
                    roots.push(target);
                }
            }
            InputFile::Dso(dso) => dso.mark_alive(),
        }
    }

    // Phase B: traverse references in parallel waves until no new file
    // wakes up.
    while !roots.is_empty() {
        let next: Vec<Vec<FileId>> = roots
            .par_iter()
            .map(|&id| {
                let mut feeder = Vec::new();
                sess.obj(id).mark_live_objects(&sess.files, &mut feeder);
                feeder
            })
            .collect();
        roots = next.into_iter().flatten().collect();
    }

    // Erase dead files; definitions they published are withdrawn so that
    // every surviving symbol owner is live (or the symbol reverts to
    // undefined).
    let dead: Vec<FileId> = sess
        .objs
        .iter()
        .chain(sess.dsos.iter())
        .copied()
        .filter(|&id| !sess.files[id as usize].is_alive())
        .collect();
    for id in dead {
        match &sess.files[id as usize] {
            InputFile::Obj(obj) => {
                for &sym in &obj.globals {
                    let mut st = sym.lock();
                    if st.file == id as i32 {
                        *st = SymState::default();
                    }
                }
            }
            InputFile::Dso(dso) => {
                for &sym in &dso.symbols {
                    let mut st = sym.lock();
                    if st.file == id as i32 {
                        *st = SymState::default();
                    }
                }
            }
        }
        tracing::debug!("dropping dead input: {}", sess.files[id as usize].name());
    }
    let files = &sess.files;
    sess.objs.retain(|&id| files[id as usize].is_alive());
    sess.dsos.retain(|&id| files[id as usize].is_alive());

    // Symbols that ended up owned by a DSO are imports; also clear the
    // placeholder bit on symbols whose archive member was pulled in.
    sess.dsos.par_iter().for_each(|&id| {
        let dso = sess.dso(id);
        for &sym in &dso.symbols {
            let mut st = sym.lock();
            if st.file == id as i32 {
                st.is_imported = true;
                st.placeholder = false;
            }
        }
    });
    sess.objs.par_iter().for_each(|&id| {
        let obj = sess.obj(id);
        for &sym in &obj.globals {
            let mut st = sym.lock();
            if st.file == id as i32 {
                st.placeholder = false;
            }
        }
    });
}

/// Two surviving strong definitions of the same name are an error unless
/// `--allow-multiple-definition`. Weak and common definitions lose
/// silently, and definitions whose section a comdat round dropped are
/// exempt.
#[tracing::instrument(skip_all, name = "Check duplicate symbols")]
pub fn check_duplicate_symbols(sess: &LinkSession) -> Result<()> {
    sess.objs.par_iter().for_each(|&id| {
        let obj = sess.obj(id);
        if obj.esyms.is_empty() {
            return;
        }
        for (slot, &sym) in obj.globals.iter().enumerate() {
            let esym = &obj.esyms[obj.first_global + slot];
            if !esym.is_defined() || esym.is_weak() || esym.is_common() {
                continue;
            }
            let eliminated = if esym.is_abs() {
                false
            } else {
                !matches!(
                    obj.sections.get(esym.shndx as usize),
                    Some(SectionSlot::Regular(isec)) if isec.is_alive(),
                ) && !matches!(obj.sections.get(esym.shndx as usize), Some(SectionSlot::Merged(_)))
            };
            if eliminated {
                continue;
            }
            let st = sym.lock();
            if st.file != id as i32 {
                let owner = if st.file >= 0 {
                    sess.files[st.file as usize].name().to_string()
                } else {
                    "<none>".to_string()
                };
                sess.errors.report(format!(
                    "duplicate symbol: {}: {}: {}",
                    obj.name,
                    owner,
                    sym.name_str()
                ));
            }
        }
    });
    sess.errors.checkpoint()
}

/// For a shared library, decide per symbol whether it is imported and
/// exported from its ELF visibility; `-Bsymbolic` (and
/// `-Bsymbolic-functions` for functions) bind defaults locally, but never
/// override explicit visibility.
#[tracing::instrument(skip_all, name = "Compute visibility")]
pub fn compute_visibility(sess: &LinkSession) {
    if !sess.config.shared {
        return;
    }
    sess.objs.par_iter().for_each(|&id| {
        let obj = sess.obj(id);
        for &sym in &obj.globals {
            let mut st = sym.lock();
            if st.file != id as i32 {
                continue;
            }
            let bsymbolic = sess.config.b_symbolic
                || (sess.config.b_symbolic_functions && st.sym_type == object::elf::STT_FUNC);
            let visibility = if st.visibility == object::elf::STV_DEFAULT && bsymbolic {
                object::elf::STV_PROTECTED
            } else {
                st.visibility
            };
            match visibility {
                object::elf::STV_DEFAULT => {
                    st.is_imported = true;
                    st.is_exported = true;
                }
                object::elf::STV_PROTECTED => {
                    st.is_imported = false;
                    st.is_exported = true;
                }
                _ => {
                    st.is_imported = false;
                    st.is_exported = false;
                }
            }
        }
    });
}

/// `--export-dynamic` (and shared output) put every default-visibility
/// definition into .dynsym.
#[tracing::instrument(skip_all, name = "Export dynamic symbols")]
pub fn export_dynamic(sess: &LinkSession) {
    if !sess.config.export_dynamic && !sess.config.shared {
        return;
    }
    sess.objs.par_iter().for_each(|&id| {
        let obj = sess.obj(id);
        for &sym in &obj.globals {
            let st = sym.lock();
            if st.file == id as i32 && st.visibility == object::elf::STV_DEFAULT {
                drop(st);
                sym.add_flags(NEEDS_DYNSYM);
                let mut st = sym.lock();
                st.is_exported = true;
            }
        }
    });
}
