//! Command-line configuration.
//!
//! When used as a linker backend (via `clang -fuse-ld=rld`), the compiler
//! driver passes arguments in order like: `rld crt1.o -L/path -lc file.o -o
//! out`. Library order matters: `-lc` only resolves symbols from objects
//! appearing before it, and `--as-needed`/`--whole-archive` only affect the
//! files after them. Clap can't preserve this order, so we capture all
//! positional args and scan them ourselves, ld-style (one or two leading
//! dashes both accepted for long options).

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;

/// A minimal parallel linker for x86_64 ELF binaries.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// All arguments (files, -l, -L, -o, flags) in order.
    /// Order matters for library resolution and archive modes.
    #[arg(required = true, allow_hyphen_values = true, num_args = 1..)]
    pub args: Vec<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

/// One element of the ordered input stream handed to the file reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSpec {
    File(PathBuf),
    Library(String),
    AsNeeded(bool),
    WholeArchive(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashStyle {
    Sysv,
    Gnu,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildId {
    None,
    Fast,
    Uuid,
    Md5,
    Sha1,
    Sha256,
}

impl BuildId {
    pub fn size(self) -> usize {
        match self {
            BuildId::None => 0,
            BuildId::Fast | BuildId::Uuid | BuildId::Md5 => 16,
            BuildId::Sha1 => 20,
            BuildId::Sha256 => 32,
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub output: PathBuf,
    pub inputs: Vec<InputSpec>,
    pub library_paths: Vec<String>,
    pub sysroot: String,
    pub is_static: bool,
    pub shared: bool,
    pub pic: bool,
    pub entry: String,
    pub undefined: Vec<String>,
    pub gc_sections: bool,
    pub icf: bool,
    pub strip_all: bool,
    pub export_dynamic: bool,
    pub b_symbolic: bool,
    pub b_symbolic_functions: bool,
    pub hash_style: HashStyle,
    pub build_id: BuildId,
    pub eh_frame_hdr: bool,
    pub soname: String,
    pub rpaths: String,
    pub trace_symbols: Vec<String>,
    pub print_map: bool,
    pub print_stats: bool,
    pub thread_count: usize,
    pub allow_multiple_definition: bool,
    pub preload: bool,
    pub fork: bool,
    pub quick_exit: bool,
    pub dynamic_linker: String,
    pub image_base: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            output: PathBuf::new(),
            inputs: Vec::new(),
            library_paths: Vec::new(),
            sysroot: String::new(),
            is_static: false,
            shared: false,
            pic: false,
            entry: "_start".to_string(),
            undefined: Vec::new(),
            gc_sections: false,
            icf: false,
            strip_all: false,
            export_dynamic: false,
            b_symbolic: false,
            b_symbolic_functions: false,
            hash_style: HashStyle::Both,
            build_id: BuildId::None,
            eh_frame_hdr: false,
            soname: String::new(),
            rpaths: String::new(),
            trace_symbols: Vec::new(),
            print_map: false,
            print_stats: false,
            thread_count: 0,
            allow_multiple_definition: false,
            preload: false,
            fork: false,
            quick_exit: false,
            dynamic_linker: "/lib64/ld-linux-x86-64.so.2".to_string(),
            image_base: 0x200000,
            log_level: "warn".to_string(),
        }
    }
}

/// Consumes a flag with no value: `-name` or `--name`.
fn read_flag(args: &mut &[String], name: &str) -> bool {
    if let Some(first) = args.first() {
        if strip_dashes(first) == Some(name) {
            *args = &args[1..];
            return true;
        }
    }
    false
}

/// Consumes `-name VAL`, `--name VAL`, `-name=VAL`, or `--name=VAL`.
/// Single-letter options also accept the attached form `-lfoo`.
fn read_arg(args: &mut &[String], name: &str) -> Result<Option<String>> {
    let Some(first) = args.first() else {
        return Ok(None);
    };
    let Some(stem) = strip_dashes(first) else {
        return Ok(None);
    };
    if stem == name {
        if args.len() < 2 {
            bail!("option -{} requires an argument", name);
        }
        let val = args[1].clone();
        *args = &args[2..];
        return Ok(Some(val));
    }
    if let Some(rest) = stem.strip_prefix(name) {
        if let Some(val) = rest.strip_prefix('=') {
            let val = val.to_string();
            *args = &args[1..];
            return Ok(Some(val));
        }
        if name.len() == 1 && !rest.is_empty() {
            let val = rest.to_string();
            *args = &args[1..];
            return Ok(Some(val));
        }
    }
    Ok(None)
}

fn strip_dashes(arg: &str) -> Option<&str> {
    arg.strip_prefix("--").or_else(|| arg.strip_prefix('-'))
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Config> {
        let mut config = Config::parse_args(&cli.args)?;
        config.log_level = cli.log_level.clone();
        Ok(config)
    }

    /// Scans the ordered argument stream. Options that affect only the
    /// files after them become `InputSpec` entries; everything else sets a
    /// config field. Unknown dash-options are fatal.
    pub fn parse_args(raw: &[String]) -> Result<Config> {
        let mut config = Config::default();
        let mut args = raw;

        while !args.is_empty() {
            let arg = args[0].as_str();

            if let Some(val) = read_arg(&mut args, "o")? {
                config.output = PathBuf::from(val);
            } else if read_flag(&mut args, "as-needed") {
                config.inputs.push(InputSpec::AsNeeded(true));
            } else if read_flag(&mut args, "no-as-needed") {
                config.inputs.push(InputSpec::AsNeeded(false));
            } else if read_flag(&mut args, "whole-archive") {
                config.inputs.push(InputSpec::WholeArchive(true));
            } else if read_flag(&mut args, "no-whole-archive") {
                config.inputs.push(InputSpec::WholeArchive(false));
            } else if let Some(val) = read_arg(&mut args, "L")? {
                config.library_paths.push(val);
            } else if let Some(val) = read_arg(&mut args, "sysroot")? {
                config.sysroot = val;
            } else if read_flag(&mut args, "static") {
                config.is_static = true;
            } else if read_flag(&mut args, "shared") {
                config.shared = true;
            } else if read_flag(&mut args, "pic") {
                config.pic = true;
            } else if let Some(val) = read_arg(&mut args, "entry")? {
                config.entry = val;
            } else if let Some(val) = read_arg(&mut args, "undefined")? {
                config.undefined.push(val);
            } else if let Some(val) = read_arg(&mut args, "u")? {
                config.undefined.push(val);
            } else if read_flag(&mut args, "gc-sections") {
                config.gc_sections = true;
            } else if read_flag(&mut args, "no-gc-sections") {
                config.gc_sections = false;
            } else if read_flag(&mut args, "icf") {
                config.icf = true;
            } else if read_flag(&mut args, "strip-all") || read_flag(&mut args, "s") {
                config.strip_all = true;
            } else if read_flag(&mut args, "export-dynamic") || read_flag(&mut args, "E") {
                config.export_dynamic = true;
            } else if read_flag(&mut args, "Bsymbolic-functions") {
                config.b_symbolic_functions = true;
            } else if read_flag(&mut args, "Bsymbolic") {
                config.b_symbolic = true;
            } else if let Some(val) = read_arg(&mut args, "hash-style")? {
                config.hash_style = match val.as_str() {
                    "sysv" => HashStyle::Sysv,
                    "gnu" => HashStyle::Gnu,
                    "both" => HashStyle::Both,
                    other => bail!("invalid --hash-style: {}", other),
                };
            } else if let Some(val) = read_arg(&mut args, "build-id")? {
                config.build_id = match val.as_str() {
                    "none" => BuildId::None,
                    "fast" => BuildId::Fast,
                    "uuid" => BuildId::Uuid,
                    "md5" => BuildId::Md5,
                    "sha1" => BuildId::Sha1,
                    "sha256" => BuildId::Sha256,
                    other => bail!("invalid --build-id: {}", other),
                };
            } else if read_flag(&mut args, "build-id") {
                config.build_id = BuildId::Sha1;
            } else if read_flag(&mut args, "eh-frame-hdr") {
                config.eh_frame_hdr = true;
            } else if let Some(val) = read_arg(&mut args, "soname")? {
                config.soname = val;
            } else if let Some(val) = read_arg(&mut args, "rpath")? {
                if config.rpaths.is_empty() {
                    config.rpaths = val;
                } else {
                    config.rpaths.push(':');
                    config.rpaths.push_str(&val);
                }
            } else if let Some(val) = read_arg(&mut args, "trace-symbol")? {
                config.trace_symbols.push(val);
            } else if let Some(val) = read_arg(&mut args, "y")? {
                config.trace_symbols.push(val);
            } else if read_flag(&mut args, "print-map") || read_flag(&mut args, "M") {
                config.print_map = true;
            } else if read_flag(&mut args, "print-stats") {
                config.print_stats = true;
            } else if let Some(val) = read_arg(&mut args, "threads")? {
                config.thread_count =
                    val.parse().map_err(|_| anyhow::anyhow!("invalid --threads value: {}", val))?;
            } else if read_flag(&mut args, "allow-multiple-definition") {
                config.allow_multiple_definition = true;
            } else if read_flag(&mut args, "preload") {
                config.preload = true;
            } else if read_flag(&mut args, "fork") {
                config.fork = true;
            } else if read_flag(&mut args, "quick-exit") {
                config.quick_exit = true;
            } else if let Some(val) = read_arg(&mut args, "dynamic-linker")? {
                config.dynamic_linker = val;
            } else if let Some(val) = read_arg(&mut args, "image-base")? {
                config.image_base = parse_number(&val)?;
            } else if let Some(val) = read_arg(&mut args, "m")? {
                if val != "elf_x86_64" {
                    bail!("unsupported emulation: {}", val);
                }
            } else if read_flag(&mut args, "start-group") || read_flag(&mut args, "end-group") {
                // Archive member liveness is resolved globally, so grouping
                // has no effect here.
            } else if let Some(val) = read_arg(&mut args, "e")? {
                // Must stay below every other flag spelled with a leading
                // 'e' so the attached form does not swallow them.
                config.entry = val;
            } else if let Some(val) = read_arg(&mut args, "l")? {
                config.inputs.push(InputSpec::Library(val));
            } else if arg.starts_with('-') && arg != "-" {
                bail!("unknown command line option: {}", arg);
            } else {
                config.inputs.push(InputSpec::File(PathBuf::from(arg)));
                args = &args[1..];
            }
        }

        if config.output.as_os_str().is_empty() {
            bail!("-o option is missing");
        }
        if config.pic || config.shared {
            config.image_base = 0;
        }
        Ok(config)
    }
}

fn parse_number(val: &str) -> Result<u64> {
    let parsed = if let Some(hex) = val.strip_prefix("0x").or_else(|| val.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        val.parse()
    };
    parsed.map_err(|_| anyhow::anyhow!("invalid number: {}", val))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        Config::parse_args(&args)
    }

    #[test]
    fn ordered_inputs() {
        let config = parse(&[
            "crt1.o",
            "--as-needed",
            "-lc",
            "--no-as-needed",
            "main.o",
            "-o",
            "a.out",
        ])
        .unwrap();
        assert_eq!(
            config.inputs,
            vec![
                InputSpec::File(PathBuf::from("crt1.o")),
                InputSpec::AsNeeded(true),
                InputSpec::Library("c".to_string()),
                InputSpec::AsNeeded(false),
                InputSpec::File(PathBuf::from("main.o")),
            ]
        );
        assert_eq!(config.output, PathBuf::from("a.out"));
    }

    #[test]
    fn equals_and_attached_forms() {
        let config = parse(&["-o", "x", "--hash-style=gnu", "-L/usr/lib", "-lm"]).unwrap();
        assert_eq!(config.hash_style, HashStyle::Gnu);
        assert_eq!(config.library_paths, vec!["/usr/lib".to_string()]);
        assert_eq!(config.inputs, vec![InputSpec::Library("m".to_string())]);
    }

    #[test]
    fn missing_output_is_fatal() {
        assert!(parse(&["main.o"]).is_err());
    }

    #[test]
    fn unknown_flag_is_fatal() {
        assert!(parse(&["-o", "x", "--definitely-not-a-flag"]).is_err());
    }

    #[test]
    fn shared_clears_image_base() {
        let config = parse(&["-o", "x", "--shared", "a.o"]).unwrap();
        assert!(config.shared);
        assert_eq!(config.image_base, 0);
    }

    #[test]
    fn single_dash_long_options() {
        let config = parse(&["-o", "x", "-soname", "libx.so.1", "-Bsymbolic"]).unwrap();
        assert_eq!(config.soname, "libx.so.1");
        assert!(config.b_symbolic);
    }
}
