//! End-to-end links over synthesized inputs.
//!
//! Each test builds tiny relocatable objects in memory with `object::write`,
//! runs the full pipeline, and re-reads the produced image to check the
//! layout, symbol addresses, and relocation results.

use std::path::{Path, PathBuf};

use object::elf;
use object::read::elf::{Dyn as _, FileHeader as _, ProgramHeader as _, SectionHeader as _};
use object::write::{Object as WObject, Relocation, StandardSegment, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, LittleEndian, Object as _, ObjectSection as _,
    ObjectSymbol as _, RelocationFlags, SectionKind, SymbolFlags, SymbolKind, SymbolScope,
};

use rld::config::Config;
use rld::linker;

const LE: LittleEndian = LittleEndian;

fn new_obj() -> WObject<'static> {
    WObject::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little)
}

fn tmpdir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("rld-test-{}-{}", tag, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_input(dir: &Path, name: &str, bytes: &[u8]) -> String {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path.to_string_lossy().into_owned()
}

fn link(args: &[&str]) -> anyhow::Result<()> {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    let config = Config::parse_args(&args)?;
    linker::link(config)
}

/// A minimal System V archive holding the given (name, bytes) members.
fn build_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = b"!<arch>\n".to_vec();
    for (name, data) in members {
        let header = format!(
            "{:<16}{:<12}{:<6}{:<6}{:<8}{:<10}`\n",
            format!("{}/", name),
            0,
            0,
            0,
            "100644",
            data.len()
        );
        assert_eq!(header.len(), 60);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(data);
        if data.len() % 2 == 1 {
            out.push(b'\n');
        }
    }
    out
}

fn add_text(obj: &mut WObject, code: &[u8]) -> object::write::SectionId {
    let seg = obj.segment_name(StandardSegment::Text).to_vec();
    let text = obj.add_section(seg, b".text".to_vec(), SectionKind::Text);
    obj.append_section_data(text, code, 16);
    text
}

fn add_global_func(
    obj: &mut WObject,
    section: object::write::SectionId,
    name: &str,
    value: u64,
) -> object::write::SymbolId {
    obj.add_symbol(Symbol {
        name: name.as_bytes().to_vec(),
        value,
        size: 1,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(section),
        flags: SymbolFlags::None,
    })
}

fn add_undefined(obj: &mut WObject, name: &str) -> object::write::SymbolId {
    obj.add_symbol(Symbol {
        name: name.as_bytes().to_vec(),
        value: 0,
        size: 0,
        kind: SymbolKind::Unknown,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Undefined,
        flags: SymbolFlags::None,
    })
}

/// An object whose only content is `_start: ret`.
fn start_obj() -> Vec<u8> {
    let mut obj = new_obj();
    let text = add_text(&mut obj, &[0xc3]);
    add_global_func(&mut obj, text, "_start", 0);
    obj.write().unwrap()
}

fn read_dynamic(data: &[u8]) -> Vec<(u64, u64)> {
    let ehdr = elf::FileHeader64::<LittleEndian>::parse(data).unwrap();
    let sections = ehdr.sections(LE, data).unwrap();
    for shdr in sections.iter() {
        if shdr.sh_type(LE) == elf::SHT_DYNAMIC {
            if let Some((dyns, _)) = shdr.dynamic(LE, data).unwrap() {
                return dyns.iter().map(|d| (d.d_tag(LE), d.d_val(LE))).collect();
            }
        }
    }
    Vec::new()
}

#[test]
fn links_minimal_static_executable() {
    let dir = tmpdir("minimal");
    let input = write_input(&dir, "start.o", &start_obj());
    let out = dir.join("a.out");

    link(&["--static", "-o", out.to_str().unwrap(), &input]).unwrap();

    let data = std::fs::read(&out).unwrap();
    let file = object::File::parse(&*data).unwrap();
    assert_eq!(file.format(), BinaryFormat::Elf);

    let start = file
        .symbols()
        .find(|s| s.name() == Ok("_start"))
        .expect("_start in symtab");
    assert_eq!(file.entry(), start.address());
    assert_ne!(start.address(), 0);

    let ehdr = elf::FileHeader64::<LittleEndian>::parse(&*data).unwrap();
    assert_eq!(ehdr.e_type.get(LE), elf::ET_EXEC);
}

#[test]
fn absolute_relocation_points_at_symbol() {
    let dir = tmpdir("abs64");
    let mut obj = new_obj();
    let text = add_text(&mut obj, &[0xc3]);
    let start = add_global_func(&mut obj, text, "_start", 0);
    let seg = obj.segment_name(StandardSegment::Data).to_vec();
    let dsec = obj.add_section(seg, b".data".to_vec(), SectionKind::Data);
    obj.append_section_data(dsec, &[0u8; 8], 8);
    obj.add_relocation(
        dsec,
        Relocation {
            offset: 0,
            symbol: start,
            addend: 0,
            flags: RelocationFlags::Elf { r_type: elf::R_X86_64_64 },
        },
    )
    .unwrap();

    let input = write_input(&dir, "abs.o", &obj.write().unwrap());
    let out = dir.join("abs.out");
    link(&["--static", "-o", out.to_str().unwrap(), &input]).unwrap();

    let data = std::fs::read(&out).unwrap();
    let file = object::File::parse(&*data).unwrap();
    let start_addr = file.symbols().find(|s| s.name() == Ok("_start")).unwrap().address();
    let dsec = file.section_by_name(".data").unwrap();
    let bytes = dsec.data().unwrap();
    assert_eq!(u64::from_le_bytes(bytes[..8].try_into().unwrap()), start_addr);
}

#[test]
fn archive_members_load_on_demand() {
    let dir = tmpdir("archive");

    let make_member = |func: &str| -> Vec<u8> {
        let mut obj = new_obj();
        let text = add_text(&mut obj, &[0xc3]);
        add_global_func(&mut obj, text, func, 0);
        obj.write().unwrap()
    };
    let a = make_member("afunc");
    let b = make_member("bfunc");
    let c = make_member("cfunc");
    let archive = build_archive(&[("a.o", &a), ("b.o", &b), ("c.o", &c)]);

    // main calls only afunc.
    let mut obj = new_obj();
    let text = add_text(&mut obj, &[0xe8, 0, 0, 0, 0, 0xc3]);
    add_global_func(&mut obj, text, "_start", 0);
    let afunc = add_undefined(&mut obj, "afunc");
    obj.add_relocation(
        text,
        Relocation {
            offset: 1,
            symbol: afunc,
            addend: -4,
            flags: RelocationFlags::Elf { r_type: elf::R_X86_64_PLT32 },
        },
    )
    .unwrap();

    let main = write_input(&dir, "main.o", &obj.write().unwrap());
    let lib = write_input(&dir, "libutil.a", &archive);

    let out = dir.join("ondemand.out");
    link(&["--static", "-o", out.to_str().unwrap(), &main, &lib]).unwrap();
    let data = std::fs::read(&out).unwrap();
    let file = object::File::parse(&*data).unwrap();
    let names: Vec<&str> = file.symbols().filter_map(|s| s.name().ok()).collect();
    assert!(names.contains(&"afunc"));
    assert!(!names.contains(&"bfunc"));
    assert!(!names.contains(&"cfunc"));

    let out2 = dir.join("whole.out");
    link(&[
        "--static",
        "-o",
        out2.to_str().unwrap(),
        &main,
        "--whole-archive",
        &lib,
        "--no-whole-archive",
    ])
    .unwrap();
    let data2 = std::fs::read(&out2).unwrap();
    let file2 = object::File::parse(&*data2).unwrap();
    let names2: Vec<&str> = file2.symbols().filter_map(|s| s.name().ok()).collect();
    assert!(names2.contains(&"afunc"));
    assert!(names2.contains(&"bfunc"));
    assert!(names2.contains(&"cfunc"));
}

/// Two objects with identical mergeable strings: the output carries one
/// copy, and references resolve to two distinct addresses 6 bytes apart.
#[test]
fn merges_identical_strings() {
    let dir = tmpdir("merge");

    let make = |with_start: bool| -> Vec<u8> {
        let mut obj = new_obj();
        let text = add_text(&mut obj, &[0xc3]);
        if with_start {
            add_global_func(&mut obj, text, "_start", 0);
        }
        let seg = obj.segment_name(StandardSegment::Data).to_vec();
        let strs = obj.add_section(seg, b".rodata.str1.1".to_vec(), SectionKind::ReadOnlyString);
        obj.append_section_data(strs, b"hello\0world\0", 1);
        let strsym = obj.section_symbol(strs);

        let dseg = obj.segment_name(StandardSegment::Data).to_vec();
        let dsec = obj.add_section(dseg, b".data".to_vec(), SectionKind::Data);
        obj.append_section_data(dsec, &[0u8; 16], 8);
        for (off, addend) in [(0i64, 0i64), (8, 6)] {
            obj.add_relocation(
                dsec,
                Relocation {
                    offset: off as u64,
                    symbol: strsym,
                    addend,
                    flags: RelocationFlags::Elf { r_type: elf::R_X86_64_64 },
                },
            )
            .unwrap();
        }
        obj.write().unwrap()
    };

    let one = write_input(&dir, "one.o", &make(true));
    let two = write_input(&dir, "two.o", &make(false));
    let out = dir.join("merge.out");
    link(&["--static", "-o", out.to_str().unwrap(), &one, &two]).unwrap();

    let data = std::fs::read(&out).unwrap();
    let file = object::File::parse(&*data).unwrap();

    let rodata = file.section_by_name(".rodata").expect("merged .rodata");
    let bytes = rodata.data().unwrap();
    let count = bytes.windows(6).filter(|w| *w == b"hello\0").count();
    assert_eq!(count, 1, "string must be deduplicated");

    let dsec = file.section_by_name(".data").unwrap();
    let d = dsec.data().unwrap();
    let hello1 = u64::from_le_bytes(d[0..8].try_into().unwrap());
    let world1 = u64::from_le_bytes(d[8..16].try_into().unwrap());
    let hello2 = u64::from_le_bytes(d[16..24].try_into().unwrap());
    let world2 = u64::from_le_bytes(d[24..32].try_into().unwrap());

    assert_eq!(world1, hello1 + 6);
    // References from both files collapse to the same two addresses.
    assert_eq!(hello1, hello2);
    assert_eq!(world1, world2);
    let start = rodata.address();
    let end = start + rodata.size();
    assert!(hello1 >= start && world1 < end);
}

#[test]
fn duplicate_strong_definitions() {
    let dir = tmpdir("dup");

    let make = |define_start: bool| -> Vec<u8> {
        let mut obj = new_obj();
        let text = add_text(&mut obj, &[0x90, 0xc3]);
        add_global_func(&mut obj, text, "f", 0);
        if define_start {
            add_global_func(&mut obj, text, "_start", 1);
        }
        obj.write().unwrap()
    };
    let one = write_input(&dir, "dup1.o", &make(true));
    let two = write_input(&dir, "dup2.o", &make(false));
    let out = dir.join("dup.out");

    let err = link(&["--static", "-o", out.to_str().unwrap(), &one, &two])
        .expect_err("duplicate definitions must fail");
    let msg = format!("{:#}", err);
    assert!(msg.contains("duplicate symbol"), "got: {}", msg);
    assert!(msg.contains("dup1.o") && msg.contains("dup2.o"), "got: {}", msg);

    // With --allow-multiple-definition the first definition wins.
    link(&[
        "--static",
        "--allow-multiple-definition",
        "-o",
        out.to_str().unwrap(),
        &one,
        &two,
    ])
    .unwrap();
    let data = std::fs::read(&out).unwrap();
    let file = object::File::parse(&*data).unwrap();
    let f = file.symbols().find(|s| s.name() == Ok("f")).unwrap();
    let text = file.section_by_name(".text").unwrap();
    assert_eq!(f.address(), text.address(), "first file's definition wins");
}

#[test]
fn shared_library_gets_soname() {
    let dir = tmpdir("shared");
    let mut obj = new_obj();
    let text = add_text(&mut obj, &[0xc3]);
    add_global_func(&mut obj, text, "foo", 0);
    let input = write_input(&dir, "foo.o", &obj.write().unwrap());
    let out = dir.join("libfoo.so.1");

    link(&[
        "--shared",
        "-soname",
        "libfoo.so.1",
        "-o",
        out.to_str().unwrap(),
        &input,
    ])
    .unwrap();

    let data = std::fs::read(&out).unwrap();
    let ehdr = elf::FileHeader64::<LittleEndian>::parse(&*data).unwrap();
    assert_eq!(ehdr.e_type.get(LE), elf::ET_DYN);

    let dyns = read_dynamic(&data);
    let soname_val = dyns
        .iter()
        .find(|&&(tag, _)| tag == u64::from(elf::DT_SONAME))
        .map(|&(_, val)| val)
        .expect("DT_SONAME present");

    // Resolve the string through .dynstr.
    let file = object::File::parse(&*data).unwrap();
    let dynstr = file.section_by_name(".dynstr").unwrap();
    let bytes = dynstr.data().unwrap();
    let s = &bytes[soname_val as usize..];
    let end = s.iter().position(|&b| b == 0).unwrap();
    assert_eq!(&s[..end], b"libfoo.so.1");

    // The exported symbol must be in .dynsym.
    assert!(file.dynamic_symbols().any(|s| s.name() == Ok("foo")));
}

#[test]
fn relaxes_tlsgd_to_local_exec() {
    let dir = tmpdir("tls");
    let mut obj = new_obj();
    // lea x@tlsgd(%rip),%rdi ; call __tls_get_addr@plt
    let code = [
        0x66, 0x48, 0x8d, 0x3d, 0, 0, 0, 0, // TLSGD at offset 4
        0x66, 0x66, 0x48, 0xe8, 0, 0, 0, 0, // PLT32 at offset 12
        0xc3,
    ];
    let text = add_text(&mut obj, &code);
    add_global_func(&mut obj, text, "_start", 16);

    let seg = obj.segment_name(StandardSegment::Data).to_vec();
    let tdata = obj.add_section(seg, b".tdata".to_vec(), SectionKind::Tls);
    obj.append_section_data(tdata, &[1, 2, 3, 4, 5, 6, 7, 8], 8);
    let x = obj.add_symbol(Symbol {
        name: b"x".to_vec(),
        value: 0,
        size: 8,
        kind: SymbolKind::Tls,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(tdata),
        flags: SymbolFlags::None,
    });
    let tls_get_addr = add_undefined(&mut obj, "__tls_get_addr");
    obj.add_relocation(
        text,
        Relocation {
            offset: 4,
            symbol: x,
            addend: -4,
            flags: RelocationFlags::Elf { r_type: elf::R_X86_64_TLSGD },
        },
    )
    .unwrap();
    obj.add_relocation(
        text,
        Relocation {
            offset: 12,
            symbol: tls_get_addr,
            addend: -4,
            flags: RelocationFlags::Elf { r_type: elf::R_X86_64_PLT32 },
        },
    )
    .unwrap();

    let input = write_input(&dir, "tls.o", &obj.write().unwrap());
    let out = dir.join("tls.out");
    link(&["--static", "-o", out.to_str().unwrap(), &input]).unwrap();

    let data = std::fs::read(&out).unwrap();
    let file = object::File::parse(&*data).unwrap();
    let text = file.section_by_name(".text").unwrap();
    let bytes = text.data().unwrap();

    let expected: [u8; 16] = [
        0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, 0x48, 0x8d, 0x80, 0, 0, 0, 0,
    ];
    assert_eq!(&bytes[..12], &expected[..12]);

    // The trailing tpoff equals S - tls_end (the addend of -4 cancels the
    // +4 the relaxation adds).
    let ehdr = elf::FileHeader64::<LittleEndian>::parse(&*data).unwrap();
    let mut tls_end = 0u64;
    let mut tls_vaddr = 0u64;
    for phdr in ehdr.program_headers(LE, &*data).unwrap() {
        if phdr.p_type(LE) == elf::PT_TLS {
            tls_vaddr = phdr.p_vaddr(LE);
            let align = phdr.p_align(LE).max(1);
            let end = phdr.p_vaddr(LE) + phdr.p_memsz(LE);
            tls_end = (end + align - 1) & !(align - 1);
        }
    }
    assert_ne!(tls_end, 0, "PT_TLS must exist");
    let tpoff = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
    assert_eq!(tpoff, (tls_vaddr.wrapping_sub(tls_end)) as u32);
}

#[test]
fn output_is_deterministic() {
    let dir = tmpdir("determinism");
    let input = write_input(&dir, "start.o", &start_obj());
    let out1 = dir.join("d1.out");
    let out2 = dir.join("d2.out");

    link(&["--static", "-o", out1.to_str().unwrap(), &input]).unwrap();
    link(&["--static", "-o", out2.to_str().unwrap(), &input]).unwrap();

    let a = std::fs::read(&out1).unwrap();
    let b = std::fs::read(&out2).unwrap();
    assert_eq!(a, b);
}

#[test]
fn got_reference_resolves_through_got() {
    let dir = tmpdir("got");
    let mut obj = new_obj();
    // mov foo@gotpcrel(%rip),%rax ; ret
    let code = [0x48, 0x8b, 0x05, 0, 0, 0, 0, 0xc3];
    let text = add_text(&mut obj, &code);
    add_global_func(&mut obj, text, "_start", 7);

    let seg = obj.segment_name(StandardSegment::Data).to_vec();
    let dsec = obj.add_section(seg, b".data".to_vec(), SectionKind::Data);
    obj.append_section_data(dsec, &[0xaa; 8], 8);
    let foo = obj.add_symbol(Symbol {
        name: b"foo".to_vec(),
        value: 0,
        size: 8,
        kind: SymbolKind::Data,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(dsec),
        flags: SymbolFlags::None,
    });
    obj.add_relocation(
        text,
        Relocation {
            offset: 3,
            symbol: foo,
            addend: -4,
            flags: RelocationFlags::Elf { r_type: elf::R_X86_64_REX_GOTPCRELX },
        },
    )
    .unwrap();

    let input = write_input(&dir, "got.o", &obj.write().unwrap());
    let out = dir.join("got.out");
    link(&["--static", "-o", out.to_str().unwrap(), &input]).unwrap();

    let data = std::fs::read(&out).unwrap();
    let file = object::File::parse(&*data).unwrap();
    let foo_addr = file.symbols().find(|s| s.name() == Ok("foo")).unwrap().address();

    // The GOT holds foo's address...
    let got = file.section_by_name(".got").expect(".got section");
    let got_bytes = got.data().unwrap();
    let slots: Vec<u64> = got_bytes
        .chunks(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    assert!(slots.contains(&foo_addr));

    // ...and the instruction displacement lands on that slot.
    let text = file.section_by_name(".text").unwrap();
    let code = text.data().unwrap();
    let disp = i32::from_le_bytes(code[3..7].try_into().unwrap());
    let p = text.address() + 3;
    let slot_addr = (p as i64 + 4 + i64::from(disp)) as u64;
    let slot_index = ((slot_addr - got.address()) / 8) as usize;
    assert_eq!(slots[slot_index], foo_addr);
}
