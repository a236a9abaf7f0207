//! Parallel Linker Library.
//!
//! This library provides the core components for the `rld` linker.
//! It is organized into several modules:
//! - `config`: CLI configuration.
//! - `input`: Input file classification and archive expansion.
//! - `script`: GNU linker-script subset.
//! - `symbol`: The process-wide symbol table.
//! - `obj` / `dso`: Per-file parsed state.
//! - `resolve`: Symbol resolution and file liveness.
//! - `merge`: Mergeable string deduplication.
//! - `layout`: Output section composition and address assignment.
//! - `reloc`: Relocation scanning and application.
//! - `chunks`: Output chunk synthesis.
//! - `writer`: Output file writing.
//! - `linker`: The pipeline driver.

pub mod chunks;
pub mod config;
pub mod dso;
pub mod elf;
pub mod input;
pub mod layout;
pub mod linker;
pub mod merge;
pub mod obj;
pub mod reloc;
pub mod resolve;
pub mod script;
pub mod session;
pub mod symbol;
pub mod writer;
