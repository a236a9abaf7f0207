//! ELF linker pipeline.
//!
//! 1. Read and parse inputs (objects, archives, shared objects, scripts)
//! 2. Resolve symbols and decide which files are live
//! 3. Deduplicate comdats and mergeable strings
//! 4. Bin input sections into output sections and lay everything out
//! 5. Scan relocations to populate GOT/PLT/dynamic tables
//! 6. Copy and patch every section, then write the ELF
//!
//! Each stage is a barrier: parallel work inside a stage never outlives it.

use std::collections::HashSet;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use object::elf;
use rayon::prelude::*;

use crate::chunks::{self, ChunkKind};
use crate::config::Config;
use crate::elf::{align_to, is_c_identifier};
use crate::input::{read_input_files, FileCache};
use crate::layout;
use crate::merge;
use crate::obj::{self, InputObject};
use crate::reloc;
use crate::resolve;
use crate::session::{leak_bytes, Counters, InputFile, LinkSession};
use crate::symbol::SymRef;
use crate::writer;

/// Synthetic symbols the linker itself defines; values are fixed once the
/// layout is known.
struct SyntheticSyms {
    bss_start: SymRef,
    ehdr_start: SymRef,
    end: SymRef,
    etext: SymRef,
    edata: SymRef,
    dynamic: SymRef,
    got: SymRef,
    eh_frame_hdr: SymRef,
    init_array_start: SymRef,
    init_array_end: SymRef,
    fini_array_start: SymRef,
    fini_array_end: SymRef,
    rela_iplt_start: SymRef,
    rela_iplt_end: SymRef,
}

pub fn link(config: Config) -> Result<()> {
    let threads = config.thread_count;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .context("failed to build thread pool")?;
    pool.install(|| link_in_pool(config))
}

fn link_in_pool(config: Config) -> Result<()> {
    let mut sess = LinkSession::new(config);

    for name in sess.config.trace_symbols.clone() {
        sess.intern_str(&name).traced.store(true, Ordering::Relaxed);
    }

    // Read and parse the inputs. With --preload, a first pass warms a
    // (name, size, mtime)-keyed cache that the main pass replays.
    let cache = FileCache::default();
    if sess.config.preload {
        let _ = read_input_files(&sess.config, &sess.symbols, &cache, true)?;
    }
    if sess.config.fork {
        tracing::warn!("--fork is not supported in this build; linking in-process");
    }
    let files = read_input_files(&sess.config, &sess.symbols, &cache, false)?;

    // Uniquify shared objects by soname.
    let mut seen_sonames: HashSet<String> = HashSet::new();
    for mut file in files {
        let id = sess.files.len() as u32;
        match &mut file {
            InputFile::Obj(o) => {
                o.id = id;
                sess.objs.push(id);
            }
            InputFile::Dso(d) => {
                if !seen_sonames.insert(d.soname.clone()) {
                    continue;
                }
                d.id = id;
                sess.dsos.push(id);
            }
        }
        sess.files.push(file);
    }

    // The internal object owns every linker-synthesized symbol.
    let internal = sess.files.len() as u32;
    let mut internal_obj = InputObject::internal();
    internal_obj.id = internal;
    sess.files.push(InputFile::Obj(internal_obj));
    sess.objs.push(internal);
    sess.internal = internal;
    let synthetic = define_synthetic_symbols(&mut sess);

    assign_priorities(&mut sess);
    resolve::resolve_symbols(&mut sess);

    obj::register_comdats(&mut sess.files, &sess.objs, &mut sess.comdats);
    obj::resolve_comdat_groups(&sess);
    obj::eliminate_duplicate_comdat_groups(&sess);

    // Create .bss-backed storage for common symbols.
    sess.files.par_iter_mut().for_each(|file| {
        if let InputFile::Obj(o) = file {
            if o.is_alive.load(Ordering::Relaxed) {
                o.convert_common_symbols();
            }
        }
    });

    if sess.config.gc_sections {
        tracing::warn!("--gc-sections is not supported; ignored");
    }
    if sess.config.icf {
        tracing::warn!("--icf is not supported; ignored");
    }
    if sess.config.eh_frame_hdr {
        tracing::warn!("--eh-frame-hdr is not supported; .eh_frame is copied as-is");
    }

    merge::register_merged_sections(&mut sess);
    merge::handle_mergeable_strings(&mut sess)?;

    layout::register_output_sections(&mut sess);
    layout::bin_sections(&mut sess);
    layout::set_isec_offsets(&mut sess);

    // Leftover undefined symbols: weak ones become absolute zero, and for
    // a shared library the rest become run-time imports.
    sess.objs.par_iter().for_each(|&id| {
        sess.obj(id).handle_undefined_weak_symbols();
    });
    if sess.config.shared {
        sess.objs.par_iter().for_each(|&id| {
            sess.obj(id).claim_unresolved_symbols();
        });
    }

    // Beyond this point no new symbols are added to the result.
    if !sess.config.allow_multiple_definition {
        resolve::check_duplicate_symbols(&sess)?;
    }
    resolve::compute_visibility(&sess);

    // Strings the dynamic section will point at.
    if !sess.config.is_static {
        for &id in &sess.dsos.clone() {
            let soname: Vec<u8> = sess.dso(id).soname.as_bytes().to_vec();
            let off = sess.synth.dynstr.add(&soname);
            sess.synth.needed_offs.push(off);
        }
        if !sess.config.rpaths.is_empty() {
            let rpaths = sess.config.rpaths.clone();
            sess.synth.rpath_off = Some(sess.synth.dynstr.add(rpaths.as_bytes()));
        }
        if !sess.config.soname.is_empty() {
            let soname = sess.config.soname.clone();
            sess.synth.soname_off = Some(sess.synth.dynstr.add(soname.as_bytes()));
        }
    }

    resolve::export_dynamic(&sess);

    reloc::scan_rels(&sess)?;
    reloc::assign_table_slots(&mut sess);

    chunks::sort_dynsym(&mut sess);
    chunks::fill_verneed(&mut sess);
    chunks::plan_symtab(&mut sess);

    chunks::create_chunks(&mut sess);
    for i in 0..sess.chunks.len() {
        chunks::update_shdr(&mut sess, i);
    }
    chunks::finalize_chunk_list(&mut sess);
    layout::assign_ptload_starts(&mut sess.chunks);
    for i in 0..sess.chunks.len() {
        chunks::update_shdr(&mut sess, i);
    }
    Counters::add(&sess.counters.output_chunks, sess.chunks.len() as u64);

    let filesize = layout::set_osec_offsets(&mut sess);

    // Addresses are final: place the synthetic symbols and find the TLS
    // segment bounds that thread-pointer-relative relocations need.
    fix_synthetic_symbols(&sess, &synthetic);
    for phdr in chunks::create_phdrs(&sess) {
        if phdr.p_type == elf::PT_TLS {
            sess.tls_begin = phdr.p_vaddr;
            sess.tls_end = align_to(phdr.p_vaddr + phdr.p_memsz, phdr.p_align.max(1));
        }
    }
    sess.entry_addr = {
        let entry = sess.intern_str(&sess.config.entry.clone());
        let addr = sess.sym_addr(entry);
        if addr == 0 && !sess.config.shared {
            tracing::warn!("entry symbol {} not found; defaulting to 0", sess.config.entry);
        }
        addr
    };

    // Copy everything into the image.
    let mut buf = vec![0u8; filesize as usize];
    writer::copy_chunks(&sess, &mut buf);
    sess.errors.checkpoint()?;

    writer::clear_padding(&sess, &mut buf);
    writer::write_build_id(&sess, &mut buf);
    writer::commit_output(&sess, &buf)?;

    if sess.config.print_map {
        writer::print_map(&sess);
    }
    if sess.config.print_stats {
        count_symbols(&sess);
        sess.counters.print();
    }

    if sess.config.quick_exit {
        std::process::exit(0);
    }
    Ok(())
}

/// Priorities break symbol-resolution ties: the internal object first,
/// then objects given on the command line, then archive members, then
/// shared objects.
fn assign_priorities(sess: &mut LinkSession) {
    let mut priority = 2u32;
    let objs = sess.objs.clone();
    let internal = sess.internal;
    for &id in &objs {
        let obj = sess.obj_mut(id);
        if !obj.is_in_lib && id != internal {
            obj.priority = priority;
            priority += 1;
        }
    }
    for &id in &objs {
        let obj = sess.obj_mut(id);
        if obj.is_in_lib {
            obj.priority = priority;
            priority += 1;
        }
    }
    for &id in &sess.dsos.clone() {
        match &mut sess.files[id as usize] {
            InputFile::Dso(d) => {
                d.priority = priority;
                priority += 1;
            }
            InputFile::Obj(_) => unreachable!(),
        }
    }
}

fn define_synthetic_symbols(sess: &mut LinkSession) -> SyntheticSyms {
    let internal = sess.internal;
    let mut define = |name: &'static [u8]| -> SymRef {
        let sym = sess.symbols.intern_alloc(name, internal);
        match &mut sess.files[internal as usize] {
            InputFile::Obj(o) => o.globals.push(sym),
            InputFile::Dso(_) => unreachable!(),
        }
        sym
    };
    SyntheticSyms {
        bss_start: define(b"__bss_start"),
        ehdr_start: define(b"__ehdr_start"),
        end: define(b"_end"),
        etext: define(b"_etext"),
        edata: define(b"_edata"),
        dynamic: define(b"_DYNAMIC"),
        got: define(b"_GLOBAL_OFFSET_TABLE_"),
        eh_frame_hdr: define(b"__GNU_EH_FRAME_HDR"),
        init_array_start: define(b"__init_array_start"),
        init_array_end: define(b"__init_array_end"),
        fini_array_start: define(b"__fini_array_start"),
        fini_array_end: define(b"__fini_array_end"),
        rela_iplt_start: define(b"__rela_iplt_start"),
        rela_iplt_end: define(b"__rela_iplt_end"),
    }
}

fn set_sym(sess: &LinkSession, sym: SymRef, value: u64, shndx: u32) {
    let mut st = sym.lock();
    if st.file == sess.internal as i32 {
        st.value = value;
        st.out_shndx = shndx;
    }
}

/// Gives every linker-defined symbol its final address, including the
/// `__start_<name>`/`__stop_<name>` pair for each output section whose
/// name is a C identifier.
fn fix_synthetic_symbols(sess: &LinkSession, syms: &SyntheticSyms) {
    let chunk_start = |idx: Option<usize>| idx.map(|i| (sess.chunks[i].shdr.sh_addr, sess.chunks[i].shndx));
    let chunk_end = |idx: Option<usize>| {
        idx.map(|i| (sess.chunks[i].shdr.sh_addr + sess.chunks[i].shdr.sh_size, sess.chunks[i].shndx))
    };

    // __bss_start: the first regular .bss output section.
    for chunk in &sess.chunks {
        if matches!(chunk.kind, ChunkKind::Regular(_)) && chunk.name == b".bss" {
            set_sym(sess, syms.bss_start, chunk.shdr.sh_addr, chunk.shndx);
            break;
        }
    }

    // __ehdr_start: where the ELF header actually landed, which is the
    // image base rounded up to the first PT_LOAD's page boundary.
    if let Some((addr, _)) = chunk_start(sess.index.ehdr) {
        set_sym(sess, syms.ehdr_start, addr, 1);
    }

    if let Some((addr, shndx)) = chunk_start(sess.index.relplt) {
        set_sym(sess, syms.rela_iplt_start, addr, shndx);
    }
    if let Some((addr, shndx)) = chunk_end(sess.index.relplt) {
        set_sym(sess, syms.rela_iplt_end, addr, shndx);
    }

    for chunk in &sess.chunks {
        match chunk.shdr.sh_type {
            elf::SHT_INIT_ARRAY => {
                set_sym(sess, syms.init_array_start, chunk.shdr.sh_addr, chunk.shndx);
                set_sym(
                    sess,
                    syms.init_array_end,
                    chunk.shdr.sh_addr + chunk.shdr.sh_size,
                    chunk.shndx,
                );
            }
            elf::SHT_FINI_ARRAY => {
                set_sym(sess, syms.fini_array_start, chunk.shdr.sh_addr, chunk.shndx);
                set_sym(
                    sess,
                    syms.fini_array_end,
                    chunk.shdr.sh_addr + chunk.shdr.sh_size,
                    chunk.shndx,
                );
            }
            _ => {}
        }
    }

    // _end, _etext, _edata: highest end of the relevant chunk class.
    for chunk in &sess.chunks {
        if chunk.is_header {
            continue;
        }
        let end = chunk.shdr.sh_addr + chunk.shdr.sh_size;
        if chunk.shdr.sh_flags & u64::from(elf::SHF_ALLOC) != 0 {
            set_sym(sess, syms.end, end, chunk.shndx);
        }
        if chunk.shdr.sh_flags & u64::from(elf::SHF_EXECINSTR) != 0 {
            set_sym(sess, syms.etext, end, chunk.shndx);
        }
        if chunk.shdr.sh_type != elf::SHT_NOBITS
            && chunk.shdr.sh_flags & u64::from(elf::SHF_ALLOC) != 0
        {
            set_sym(sess, syms.edata, end, chunk.shndx);
        }
    }

    if let Some((addr, shndx)) = chunk_start(sess.index.dynamic) {
        set_sym(sess, syms.dynamic, addr, shndx);
    }
    if let Some((addr, shndx)) = chunk_start(sess.index.gotplt) {
        set_sym(sess, syms.got, addr, shndx);
    }
    set_sym(sess, syms.eh_frame_hdr, 0, 0);

    // __start_/__stop_ for C-identifier output sections.
    let mut pairs: Vec<(Vec<u8>, u64, u64, u32)> = Vec::new();
    for chunk in &sess.chunks {
        if !chunk.is_header
            && matches!(chunk.kind, ChunkKind::Regular(_) | ChunkKind::Merged(_))
            && is_c_identifier(chunk.name)
        {
            pairs.push((
                chunk.name.to_vec(),
                chunk.shdr.sh_addr,
                chunk.shdr.sh_addr + chunk.shdr.sh_size,
                chunk.shndx,
            ));
        }
    }
    for (name, start, stop, shndx) in pairs {
        let internal = sess.internal;
        let start_sym = sess
            .symbols
            .intern_alloc(leak_bytes(&[b"__start_", name.as_slice()].concat()), internal);
        let stop_sym = sess
            .symbols
            .intern_alloc(leak_bytes(&[b"__stop_", name.as_slice()].concat()), internal);
        set_sym(sess, start_sym, start, shndx);
        set_sym(sess, stop_sym, stop, shndx);
    }
}

fn count_symbols(sess: &LinkSession) {
    let mut defined = 0u64;
    let mut undefined = 0u64;
    for &id in &sess.objs {
        let obj = sess.obj(id);
        defined += obj.first_global.saturating_sub(1) as u64;
        undefined += (obj.esyms.len() - obj.first_global.min(obj.esyms.len())) as u64;
    }
    Counters::add(&sess.counters.defined_syms, defined);
    Counters::add(&sess.counters.undefined_syms, undefined);
}
