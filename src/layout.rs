//! Layout management.
//!
//! Maps input sections from every file into aggregated output sections,
//! assigns each member its offset inside its output section, and finally
//! assigns every output chunk a file offset and virtual address. The
//! per-section offset computation is sliced so sections with millions of
//! members parallelize.

use std::sync::atomic::Ordering;

use fxhash::FxHashMap;
use object::elf;
use rayon::prelude::*;

use crate::chunks::OutChunk;
use crate::elf::{align_to, PAGE_SIZE};
use crate::obj::SectionSlot;
use crate::session::{Counters, InputFile, LinkSession};
use crate::symbol::FileId;

/// Members of an output section are offset in slices of this many input
/// sections, each slice prefix-summed independently.
const OFFSET_SLICE: usize = 10_000;

/// Flags that distinguish input sections but not the output section they
/// land in.
const FLAG_MASK: u64 = (elf::SHF_GROUP as u64)
    | (elf::SHF_COMPRESSED as u64)
    | (elf::SHF_LINK_ORDER as u64)
    | (elf::SHF_INFO_LINK as u64)
    | (elf::SHF_MERGE as u64)
    | (elf::SHF_STRINGS as u64);

/// Collapses per-function/per-datum section names to their base output
/// section: `.text.foo` → `.text`, `.rodata.str1.1` → `.rodata`, …
pub fn get_output_name(name: &'static [u8]) -> &'static [u8] {
    const PREFIXES: &[&[u8]] = &[
        b".text",
        b".data.rel.ro",
        b".data",
        b".rodata",
        b".bss.rel.ro",
        b".bss",
        b".init_array",
        b".fini_array",
        b".tbss",
        b".tdata",
        b".ctors",
        b".dtors",
        b".gcc_except_table",
    ];
    for &prefix in PREFIXES {
        if name == prefix {
            return prefix;
        }
        if name.starts_with(prefix) && name.get(prefix.len()) == Some(&b'.') {
            return prefix;
        }
    }
    name
}

/// One output section: a distinct (name, flags, type).
pub struct OutputSecDef {
    pub name: &'static [u8],
    pub sh_type: u32,
    pub sh_flags: u64,
    pub members: Vec<(FileId, u32)>,
    pub size: u64,
    pub addralign: u64,
}

#[derive(Default)]
pub struct OutputSecRegistry {
    map: FxHashMap<(&'static [u8], u64, u32), u32>,
    pub defs: Vec<OutputSecDef>,
}

impl OutputSecRegistry {
    pub fn get_or_create(&mut self, name: &'static [u8], sh_type: u32, sh_flags: u64) -> u32 {
        let name = get_output_name(name);
        let sh_flags = sh_flags & !FLAG_MASK;
        let defs = &mut self.defs;
        *self.map.entry((name, sh_flags, sh_type)).or_insert_with(|| {
            defs.push(OutputSecDef {
                name,
                sh_type,
                sh_flags,
                members: Vec::new(),
                size: 0,
                addralign: 1,
            });
            (defs.len() - 1) as u32
        })
    }
}

/// Serial: every regular input section picks (or creates) its output
/// section. Registry ids are deterministic because files are walked in
/// input order.
pub fn register_output_sections(sess: &mut LinkSession) {
    let LinkSession { files, objs, osecs, counters, .. } = sess;
    let mut nsec = 0u64;
    for &id in objs.iter() {
        let InputFile::Obj(obj) = &mut files[id as usize] else { continue };
        for slot in &mut obj.sections {
            if let SectionSlot::Regular(isec) = slot {
                isec.osec = osecs.get_or_create(isec.name, isec.sh_type, isec.sh_flags);
                nsec += 1;
            }
        }
    }
    Counters::add(&counters.input_sections, nsec);
}

/// Distributes input sections into their output sections' member lists.
/// Runs in parallel over file slices; member order is the concatenation of
/// slices in file order, so it is deterministic.
#[tracing::instrument(skip_all, name = "Bin sections")]
pub fn bin_sections(sess: &mut LinkSession) {
    let LinkSession { files, objs, osecs, .. } = sess;
    let files: &[InputFile] = files;
    let num_osec = osecs.defs.len();
    if objs.is_empty() || num_osec == 0 {
        return;
    }

    let unit = (objs.len() + 127) / 128;
    let slices: Vec<&[FileId]> = objs.chunks(unit.max(1)).collect();

    let groups: Vec<Vec<Vec<(FileId, u32)>>> = slices
        .par_iter()
        .map(|slice| {
            let mut buckets: Vec<Vec<(FileId, u32)>> = vec![Vec::new(); num_osec];
            for &id in *slice {
                let InputFile::Obj(obj) = &files[id as usize] else { continue };
                for slot in &obj.sections {
                    if let SectionSlot::Regular(isec) = slot {
                        if isec.is_alive() {
                            buckets[isec.osec as usize].push((id, isec.shndx));
                        }
                    }
                }
            }
            buckets
        })
        .collect();

    osecs.defs.par_iter_mut().enumerate().for_each(|(j, def)| {
        let total: usize = groups.iter().map(|g| g[j].len()).sum();
        def.members.reserve(total);
        for group in &groups {
            def.members.extend_from_slice(&group[j]);
        }
    });
}

/// Assigns each member section its offset within its output section, and
/// each output section its size and alignment. Members are processed in
/// slices: each slice prefix-sums independently, slice starts are combined
/// serially against the section's global alignment, then a second parallel
/// pass rebases every slice.
#[tracing::instrument(skip_all, name = "Set input section offsets")]
pub fn set_isec_offsets(sess: &mut LinkSession) {
    let LinkSession { files, osecs, .. } = sess;
    let files: &[InputFile] = files;

    osecs.defs.par_iter_mut().for_each(|def| {
        if def.members.is_empty() {
            return;
        }
        let isec_of = |&(fid, shndx): &(FileId, u32)| {
            let InputFile::Obj(obj) = &files[fid as usize] else { unreachable!() };
            match &obj.sections[shndx as usize] {
                SectionSlot::Regular(isec) => isec,
                _ => unreachable!(),
            }
        };

        let slices: Vec<&[(FileId, u32)]> = def.members.chunks(OFFSET_SLICE).collect();
        let sized: Vec<(u64, u64)> = slices
            .par_iter()
            .map(|slice| {
                let mut off = 0u64;
                let mut align = 1u64;
                for member in *slice {
                    let isec = isec_of(member);
                    off = align_to(off, isec.addralign);
                    isec.offset.store(off, Ordering::Relaxed);
                    off += isec.size;
                    align = align.max(isec.addralign);
                }
                (off, align)
            })
            .collect();

        let align = sized.iter().map(|&(_, a)| a).max().unwrap_or(1);
        let mut starts = vec![0u64; slices.len()];
        for i in 1..slices.len() {
            starts[i] = align_to(starts[i - 1] + sized[i - 1].0, align);
        }

        slices.par_iter().enumerate().skip(1).for_each(|(i, slice)| {
            for member in *slice {
                isec_of(member).offset.fetch_add(starts[i], Ordering::Relaxed);
            }
        });

        def.size = starts[slices.len() - 1] + sized[slices.len() - 1].0;
        def.addralign = align;
    });
}

/// Marks the chunks that begin a new PT_LOAD: the first allocated chunk,
/// and every allocated chunk whose segment permissions differ from its
/// predecessor's.
pub fn assign_ptload_starts(chunks: &mut [OutChunk]) {
    let mut prev_flags: Option<u32> = None;
    for chunk in chunks.iter_mut() {
        if chunk.shdr.sh_flags & u64::from(elf::SHF_ALLOC) == 0 {
            continue;
        }
        let flags = crate::elf::to_phdr_flags(&chunk.shdr);
        chunk.starts_new_ptload = prev_flags != Some(flags);
        prev_flags = Some(flags);
    }
}

/// Assigns file offsets and virtual addresses to every chunk, in order.
/// Returns the output file size.
#[tracing::instrument(skip_all, name = "Set output section offsets")]
pub fn set_osec_offsets(sess: &mut LinkSession) -> u64 {
    let image_base = sess.config.image_base;
    let mut fileoff = 0u64;
    let mut vaddr = image_base;

    for chunk in &mut sess.chunks {
        if chunk.starts_new_ptload {
            vaddr = align_to(vaddr, PAGE_SIZE);
        }

        // Keep the file offset congruent to the address modulo the page
        // size so the chunk can be mapped in place.
        if vaddr % PAGE_SIZE > fileoff % PAGE_SIZE {
            fileoff += vaddr % PAGE_SIZE - fileoff % PAGE_SIZE;
        } else if vaddr % PAGE_SIZE < fileoff % PAGE_SIZE {
            fileoff = align_to(fileoff, PAGE_SIZE) + vaddr % PAGE_SIZE;
        }

        let align = chunk.shdr.sh_addralign.max(1);
        fileoff = align_to(fileoff, align);
        vaddr = align_to(vaddr, align);

        chunk.shdr.sh_offset = fileoff;
        if chunk.shdr.sh_flags & u64::from(elf::SHF_ALLOC) != 0 {
            chunk.shdr.sh_addr = vaddr;
        }

        let is_bss = chunk.shdr.sh_type == elf::SHT_NOBITS;
        if !is_bss {
            fileoff += chunk.shdr.sh_size;
        }

        let is_tbss = is_bss && chunk.shdr.sh_flags & u64::from(elf::SHF_TLS) != 0;
        if !is_tbss {
            vaddr += chunk.shdr.sh_size;
        }
    }
    sess.filesize = fileoff;
    fileoff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_name_collapse() {
        assert_eq!(get_output_name(b".text.main"), b".text");
        assert_eq!(get_output_name(b".text"), b".text");
        assert_eq!(get_output_name(b".rodata.str1.1"), b".rodata");
        assert_eq!(get_output_name(b".data.rel.ro.local"), b".data.rel.ro");
        assert_eq!(get_output_name(b".textual"), b".textual");
        assert_eq!(get_output_name(b".mysection"), b".mysection");
    }
}
