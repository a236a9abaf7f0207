//! Input file reading.
//!
//! Classifies mapped files by magic, expands archives (fat and thin), and
//! turns the ordered command-line stream into parse jobs that fan out on
//! the thread pool. Mappings are leaked: every input outlives the link, so
//! parsed state can borrow from them freely.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use anyhow::{anyhow, bail, Context, Result};
use memmap2::Mmap;
use rayon::prelude::*;

use crate::config::{Config, InputSpec};
use crate::dso::SharedObject;
use crate::obj::InputObject;
use crate::session::InputFile;
use crate::symbol::SymbolTable;

pub struct MappedFile {
    pub name: String,
    pub data: &'static [u8],
    pub size: u64,
    pub mtime: u64,
}

impl MappedFile {
    /// Maps a file, or returns None if it does not exist.
    pub fn open(path: &Path) -> Result<Option<MappedFile>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to open {}", path.display()))
            }
        };
        let meta = file.metadata()?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let data: &'static [u8] = if meta.len() == 0 {
            &[]
        } else {
            let mmap = unsafe { Mmap::map(&file)? };
            &*Box::leak(Box::new(mmap))
        };
        Ok(Some(MappedFile {
            name: path.to_string_lossy().into_owned(),
            data,
            size: meta.len(),
            mtime,
        }))
    }

    pub fn must_open(path: &Path) -> Result<MappedFile> {
        MappedFile::open(path)?.ok_or_else(|| anyhow!("cannot open {}", path.display()))
    }

    /// Wraps a byte slice (an archive member); copies it out if it is not
    /// aligned well enough for ELF structure access.
    pub fn from_bytes(name: String, data: &'static [u8], mtime: u64) -> MappedFile {
        let data = if data.as_ptr().align_offset(8) != 0 {
            &*Box::leak(data.to_vec().into_boxed_slice())
        } else {
            data
        };
        MappedFile { name, size: data.len() as u64, data, mtime }
    }

    fn key(&self) -> CacheKey {
        (self.name.clone(), self.size, self.mtime)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Object,
    Dso,
    Archive,
    ThinArchive,
    Text,
    Unknown,
}

pub fn get_file_type(data: &[u8]) -> FileType {
    if data.len() >= 20 && data.starts_with(b"\x7fELF") {
        let e_type = u16::from_le_bytes([data[16], data[17]]);
        return match e_type {
            object::elf::ET_REL => FileType::Object,
            object::elf::ET_DYN => FileType::Dso,
            _ => FileType::Unknown,
        };
    }
    if data.starts_with(b"!<arch>\n") {
        return FileType::Archive;
    }
    if data.starts_with(b"!<thin>\n") {
        return FileType::ThinArchive;
    }
    if data.len() >= 4 && data[..4].iter().all(|&b| b.is_ascii() && !b.is_ascii_control()) {
        return FileType::Text;
    }
    FileType::Unknown
}

/// Mode flags carried across the ordered input stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadContext {
    pub as_needed: bool,
    pub whole_archive: bool,
}

pub enum ParseJob {
    Obj { mb: MappedFile, archive: Option<String>, in_lib: bool },
    Dso { mb: MappedFile, as_needed: bool },
}

type CacheKey = (String, u64, u64);

/// Preload cache: parsed files keyed by (name, size, mtime). Purely an
/// optimization; a miss just re-parses.
#[derive(Default)]
pub struct FileCache {
    map: Mutex<HashMap<CacheKey, Vec<InputFile>>>,
}

impl FileCache {
    pub fn store(&self, key: CacheKey, file: InputFile) {
        self.map.lock().unwrap().entry(key).or_default().push(file);
    }

    pub fn take(&self, key: &CacheKey) -> Option<InputFile> {
        self.map.lock().unwrap().get_mut(key)?.pop()
    }
}

/// Walks the ordered input stream, classifying and expanding every file
/// into parse jobs.
pub struct Reader<'a> {
    pub config: &'a Config,
    pub ctx: ReadContext,
    pub search_dirs: Vec<String>,
    pub jobs: Vec<ParseJob>,
}

impl<'a> Reader<'a> {
    pub fn new(config: &'a Config) -> Reader<'a> {
        Reader {
            config,
            ctx: ReadContext::default(),
            search_dirs: config.library_paths.clone(),
            jobs: Vec::new(),
        }
    }

    pub fn read_file(&mut self, mb: MappedFile) -> Result<()> {
        match get_file_type(mb.data) {
            FileType::Object => {
                self.jobs.push(ParseJob::Obj { mb, archive: None, in_lib: false });
            }
            FileType::Dso => {
                self.jobs.push(ParseJob::Dso { mb, as_needed: self.ctx.as_needed });
            }
            FileType::Archive => self.read_fat_archive(mb)?,
            FileType::ThinArchive => self.read_thin_archive(mb)?,
            FileType::Text => crate::script::parse_linker_script(self, &mb)?,
            FileType::Unknown => bail!("{}: unknown file type", mb.name),
        }
        Ok(())
    }

    fn read_fat_archive(&mut self, mb: MappedFile) -> Result<()> {
        let archive = object::read::archive::ArchiveFile::parse(mb.data)
            .with_context(|| format!("{}: failed to parse archive", mb.name))?;
        let in_lib = !self.ctx.whole_archive;
        for member in archive.members() {
            let member = member.with_context(|| format!("{}: bad archive member", mb.name))?;
            let name = String::from_utf8_lossy(member.name()).into_owned();
            let data = member
                .data(mb.data)
                .with_context(|| format!("{}({}): bad member data", mb.name, name))?;
            if data.is_empty() {
                continue;
            }
            let child = MappedFile::from_bytes(name, data, mb.mtime);
            if get_file_type(child.data) == FileType::Object {
                self.jobs.push(ParseJob::Obj {
                    mb: child,
                    archive: Some(mb.name.clone()),
                    in_lib,
                });
            } else {
                tracing::info!("{}({}): skipping non-object member", mb.name, child.name);
            }
        }
        Ok(())
    }

    fn read_thin_archive(&mut self, mb: MappedFile) -> Result<()> {
        let archive = object::read::archive::ArchiveFile::parse(mb.data)
            .with_context(|| format!("{}: failed to parse archive", mb.name))?;
        let in_lib = !self.ctx.whole_archive;
        let dir = Path::new(&mb.name).parent().unwrap_or_else(|| Path::new("."));
        for member in archive.members() {
            let member = member.with_context(|| format!("{}: bad archive member", mb.name))?;
            let name_buf = String::from_utf8_lossy(member.name()).into_owned();
            // Thin archive members live next to the archive on disk.
            let path = if Path::new(&name_buf).is_absolute() {
                PathBuf::from(&name_buf)
            } else {
                dir.join(&name_buf)
            };
            let child = MappedFile::must_open(&path)?;
            if get_file_type(child.data) == FileType::Object {
                self.jobs.push(ParseJob::Obj {
                    mb: child,
                    archive: Some(mb.name.clone()),
                    in_lib,
                });
            }
        }
        Ok(())
    }

    /// `-lfoo` resolution: try libfoo.so then libfoo.a in each search dir,
    /// skipping shared objects for a static link.
    pub fn find_library(&self, name: &str) -> Result<MappedFile> {
        for dir in &self.search_dirs {
            let root = if dir.starts_with('/') { self.config.sysroot.as_str() } else { "" };
            let stem = format!("{}{}/lib{}", root, dir, name);
            if !self.config.is_static {
                if let Some(mb) = MappedFile::open(Path::new(&format!("{}.so", stem)))? {
                    return Ok(mb);
                }
            }
            if let Some(mb) = MappedFile::open(Path::new(&format!("{}.a", stem)))? {
                return Ok(mb);
            }
        }
        bail!("library not found: -l{}", name)
    }

    /// Resolves a file path from a linker script: as given, then under the
    /// sysroot for absolute paths, then through the search dirs.
    pub fn resolve_script_path(&self, token: &str) -> Result<MappedFile> {
        if token.starts_with('/') && !self.config.sysroot.is_empty() {
            let sysrooted = format!("{}{}", self.config.sysroot, token);
            if let Some(mb) = MappedFile::open(Path::new(&sysrooted))? {
                return Ok(mb);
            }
        }
        if let Some(mb) = MappedFile::open(Path::new(token))? {
            return Ok(mb);
        }
        for dir in &self.search_dirs {
            if let Some(mb) = MappedFile::open(&Path::new(dir).join(token))? {
                return Ok(mb);
            }
        }
        bail!("cannot open {}", token)
    }
}

/// Reads every input, expands archives and scripts, and parses all
/// resulting objects in parallel. This is the task-group join point: when
/// this returns, every file is parsed.
#[tracing::instrument(skip_all, name = "Parse input files")]
pub fn read_input_files(
    config: &Config,
    symbols: &SymbolTable,
    cache: &FileCache,
    store_in_cache: bool,
) -> Result<Vec<InputFile>> {
    let mut reader = Reader::new(config);
    for spec in &config.inputs {
        match spec {
            InputSpec::File(path) => {
                let mb = MappedFile::must_open(path)?;
                reader.read_file(mb)?;
            }
            InputSpec::Library(name) => {
                let mb = reader.find_library(name)?;
                tracing::info!("-l{} resolved to {}", name, mb.name);
                reader.read_file(mb)?;
            }
            InputSpec::AsNeeded(v) => reader.ctx.as_needed = *v,
            InputSpec::WholeArchive(v) => reader.ctx.whole_archive = *v,
        }
    }

    let jobs = reader.jobs;
    let parsed: Vec<Result<Option<InputFile>>> = jobs
        .into_par_iter()
        .map(|job| -> Result<Option<InputFile>> {
            let key = match &job {
                ParseJob::Obj { mb, .. } | ParseJob::Dso { mb, .. } => mb.key(),
            };
            if !store_in_cache {
                if let Some(cached) = cache.take(&key) {
                    return Ok(Some(cached));
                }
            }
            let file = match job {
                ParseJob::Obj { mb, archive, in_lib } => InputFile::Obj(InputObject::parse(
                    &mb,
                    archive.as_deref(),
                    in_lib,
                    symbols,
                )?),
                ParseJob::Dso { mb, as_needed } => {
                    InputFile::Dso(SharedObject::parse(&mb, as_needed, symbols)?)
                }
            };
            if store_in_cache {
                cache.store(key, file);
                return Ok(None);
            }
            Ok(Some(file))
        })
        .collect();

    let mut files = Vec::new();
    for item in parsed {
        if let Some(file) = item? {
            files.push(file);
        }
    }
    Ok(files)
}
