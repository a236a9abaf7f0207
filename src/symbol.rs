//! Symbol management.
//!
//! All files share one process-wide interning table mapping a symbol name to
//! a single `Symbol` record. Interning hands out `&'static Symbol` handles;
//! everything downstream of parsing works with handles and never touches the
//! name map again, so handle access is lock-free. Mutable resolution state
//! sits behind a small per-symbol mutex; the relocation scanner's need-flag
//! updates are plain atomic OR-ins.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Mutex;

use fxhash::FxHashMap;
use object::elf;

use crate::merge::PieceRef;

/// Index into `LinkSession::files`.
pub type FileId = u32;
pub const FILE_NONE: i32 = -1;

/// The synthetic internal object always has the lowest (winning) priority.
pub const INTERNAL_PRIORITY: u32 = 1;

// Need flags accumulated by the relocation scanner.
pub const NEEDS_GOT: u32 = 1 << 0;
pub const NEEDS_PLT: u32 = 1 << 1;
pub const NEEDS_COPYREL: u32 = 1 << 2;
pub const NEEDS_DYNSYM: u32 = 1 << 3;
pub const NEEDS_GOTTPOFF: u32 = 1 << 4;
pub const NEEDS_TLSGD: u32 = 1 << 5;
pub const NEEDS_TLSLD: u32 = 1 << 6;

pub type SymRef = &'static Symbol;

/// Mutable per-symbol state, guarded by `Symbol::state`.
#[derive(Debug)]
pub struct SymState {
    /// Defining file, or `FILE_NONE` if no live object defined this name.
    pub file: i32,
    /// Election rank of the current owner; lower wins. See [`def_rank`].
    pub rank: u64,
    /// st_value within the defining section, or the absolute value.
    pub value: u64,
    /// Input section index within the owner, or `SEC_NONE` for absolute
    /// symbols and symbols synthesized by the linker.
    pub sec: i32,
    pub sym_type: u8,
    pub binding: u8,
    pub visibility: u8,
    /// Version index within the defining DSO (`VER_NDX_*` reserved below 2).
    pub ver_idx: u16,
    /// True while the owner is a dormant archive member.
    pub placeholder: bool,
    pub is_imported: bool,
    pub is_exported: bool,
    pub has_copyrel: bool,
    pub is_readonly: bool,
    /// Set when the symbol is defined inside a merged string section;
    /// `value` then holds the offset within the piece.
    pub piece: Option<PieceRef>,
    /// Output section index for linker-synthesized symbols.
    pub out_shndx: u32,
    /// Common symbols carry their alignment until converted to .bss.
    pub common_align: u64,
    pub esize: u64,
}

pub const SEC_NONE: i32 = -1;

impl Default for SymState {
    fn default() -> Self {
        SymState {
            file: FILE_NONE,
            rank: u64::MAX,
            value: 0,
            sec: SEC_NONE,
            sym_type: elf::STT_NOTYPE,
            binding: elf::STB_GLOBAL,
            visibility: elf::STV_DEFAULT,
            ver_idx: 0,
            placeholder: false,
            is_imported: false,
            is_exported: false,
            has_copyrel: false,
            is_readonly: false,
            piece: None,
            out_shndx: 0,
            common_align: 1,
            esize: 0,
        }
    }
}

pub struct Symbol {
    pub name: &'static [u8],
    pub traced: AtomicBool,
    /// NEEDS_* bits, OR-ed in without taking the mutex.
    pub flags: AtomicU32,
    pub state: Mutex<SymState>,

    // Table indices assigned by the serial aggregation pass; -1 means the
    // symbol has no entry in the table.
    pub dynsym_idx: AtomicI32,
    pub got_idx: AtomicI32,
    pub plt_idx: AtomicI32,
    pub pltgot_idx: AtomicI32,
    pub gottpoff_idx: AtomicI32,
    pub tlsgd_idx: AtomicI32,
    pub tlsld_idx: AtomicI32,
}

impl Symbol {
    fn new(name: &'static [u8]) -> Symbol {
        Symbol {
            name,
            traced: AtomicBool::new(false),
            flags: AtomicU32::new(0),
            state: Mutex::new(SymState::default()),
            dynsym_idx: AtomicI32::new(-1),
            got_idx: AtomicI32::new(-1),
            plt_idx: AtomicI32::new(-1),
            pltgot_idx: AtomicI32::new(-1),
            gottpoff_idx: AtomicI32::new(-1),
            tlsgd_idx: AtomicI32::new(-1),
            tlsld_idx: AtomicI32::new(-1),
        }
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, SymState> {
        self.state.lock().unwrap()
    }

    pub fn add_flags(&self, flags: u32) {
        self.flags.fetch_or(flags, Ordering::Relaxed);
    }

    pub fn get_flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }

    pub fn is_traced(&self) -> bool {
        self.traced.load(Ordering::Relaxed)
    }

    pub fn name_str(&self) -> std::borrow::Cow<'static, str> {
        String::from_utf8_lossy(self.name)
    }

    pub fn idx(which: &AtomicI32) -> Option<u32> {
        let v = which.load(Ordering::Relaxed);
        (v >= 0).then_some(v as u32)
    }
}

impl std::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Symbol({})", self.name_str())
    }
}

/// Election rank for a definition: strong beats weak beats common, and
/// within a strength class the lower file priority wins. Lower rank wins.
pub fn def_rank(binding: u8, is_common: bool, priority: u32) -> u64 {
    let strength: u64 = if is_common {
        2
    } else if binding == elf::STB_WEAK {
        1
    } else {
        0
    };
    (strength << 32) | u64::from(priority)
}

const SHARD_COUNT: usize = 32;

/// Process-wide name → Symbol interner, sharded by name hash.
pub struct SymbolTable {
    shards: Vec<Mutex<FxHashMap<&'static [u8], SymRef>>>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        SymbolTable {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(FxHashMap::default())).collect(),
        }
    }
}

impl SymbolTable {
    /// Returns the unique `Symbol` for `name`, creating it on first use.
    pub fn intern(&self, name: &'static [u8]) -> SymRef {
        let shard = fxhash::hash64(name) as usize % SHARD_COUNT;
        let mut map = self.shards[shard].lock().unwrap();
        *map.entry(name).or_insert_with(|| &*Box::leak(Box::new(Symbol::new(name))))
    }

    /// Interns `name` and claims it for the synthetic internal object.
    /// The internal object has priority 1 and therefore wins any later
    /// election against real input files.
    pub fn intern_alloc(&self, name: &'static [u8], internal_file: FileId) -> SymRef {
        let sym = self.intern(name);
        let mut state = sym.lock();
        let rank = def_rank(elf::STB_GLOBAL, false, INTERNAL_PRIORITY);
        if rank < state.rank {
            state.rank = rank;
            state.file = internal_file as i32;
            state.sec = SEC_NONE;
            state.placeholder = false;
            state.binding = elf::STB_GLOBAL;
            state.visibility = elf::STV_HIDDEN;
        }
        sym
    }

    /// Every interned symbol, in deterministic (name) order.
    pub fn all_symbols(&self) -> Vec<SymRef> {
        let mut out: Vec<SymRef> = Vec::new();
        for shard in &self.shards {
            out.extend(shard.lock().unwrap().values().copied());
        }
        out.sort_by_key(|sym| sym.name);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_stable() {
        let table = SymbolTable::default();
        let a = table.intern(b"main");
        let b = table.intern(b"main");
        assert!(std::ptr::eq(a, b));
        assert!(!std::ptr::eq(table.intern(b"other"), a));
    }

    #[test]
    fn rank_precedence() {
        // Strong beats weak beats common; earlier file beats later file.
        let strong_late = def_rank(elf::STB_GLOBAL, false, 10);
        let strong_early = def_rank(elf::STB_GLOBAL, false, 2);
        let weak_early = def_rank(elf::STB_WEAK, false, 2);
        let common_early = def_rank(elf::STB_GLOBAL, true, 2);
        assert!(strong_early < strong_late);
        assert!(strong_late < weak_early);
        assert!(weak_early < common_early);
    }

    #[test]
    fn intern_alloc_claims_for_internal() {
        let table = SymbolTable::default();
        let sym = table.intern_alloc(b"__bss_start", 7);
        let state = sym.lock();
        assert_eq!(state.file, 7);
        assert_eq!(state.rank, def_rank(elf::STB_GLOBAL, false, INTERNAL_PRIORITY));
    }
}
