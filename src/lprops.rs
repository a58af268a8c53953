//! The LEB properties ledger.
//!
//! Every main-area LEB handed to the sink gets a `(free, dirty, flags)`
//! record here, and the aggregate statistics the master node and the LPT
//! need are maintained alongside.

use log::debug;

use crate::format::MIN_WRITE_SZ;
use crate::util::align_up32;

/// LEB property flag: the LEB holds index nodes.
pub const LPROPS_INDEX: u8 = 1;

/// Properties of a single main-area LEB.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Lprops {
    pub free: u32,
    pub dirty: u32,
    pub flags: u8,
}

/// Aggregate LEB statistics, as recorded in the master node.
#[derive(Debug, Default)]
pub struct LpStats {
    pub empty_lebs: u32,
    pub idx_lebs: u32,
    pub total_free: u64,
    pub total_dirty: u64,
    pub total_used: u64,
    pub total_dead: u64,
    pub total_dark: u64,
}

/// Accumulates per-LEB properties and aggregate statistics as the write
/// head flushes LEBs.
pub struct Ledger {
    leb_size: u32,
    min_io_size: u32,
    dead_wm: u32,
    dark_wm: u32,
    main_first: u32,
    pub props: Vec<Lprops>,
    pub lst: LpStats,
}

impl Ledger {
    pub fn new(leb_size: u32, min_io_size: u32, dead_wm: u32, dark_wm: u32, main_first: u32) -> Ledger {
        Ledger {
            leb_size,
            min_io_size,
            dead_wm,
            dark_wm,
            main_first,
            props: Vec::new(),
            lst: LpStats::default(),
        }
    }

    /// Dark space of a LEB with `spc` bytes of free and dirty space: bytes
    /// that cannot be counted on because the node mix is not known yet.
    fn calc_dark(&self, spc: u32) -> u32 {
        if spc < self.dark_wm {
            return spc;
        }
        if spc - self.dark_wm < MIN_WRITE_SZ as u32 {
            return spc - MIN_WRITE_SZ as u32;
        }
        self.dark_wm
    }

    /// Records the properties of a flushed LEB whose data ends at `offs`.
    pub fn record(&mut self, lnum: u32, offs: u32, flags: u8) {
        let a = self.min_io_size.max(8);
        let free = self.leb_size - align_up32(offs, a);
        let dirty = self.leb_size - free - align_up32(offs, 8);
        debug!("LEB {lnum} free {free} dirty {dirty} flags {flags}");

        let i = (lnum - self.main_first) as usize;
        if self.props.len() <= i {
            self.props.resize(i + 1, Lprops::default());
        }
        self.props[i] = Lprops { free, dirty, flags };

        self.lst.total_free += free as u64;
        self.lst.total_dirty += dirty as u64;
        if flags & LPROPS_INDEX != 0 {
            self.lst.idx_lebs += 1;
        } else {
            let spc = free + dirty;
            if spc < self.dead_wm {
                self.lst.total_dead += spc as u64;
            } else {
                self.lst.total_dark += self.calc_dark(spc) as u64;
            }
            self.lst.total_used += (self.leb_size - spc) as u64;
        }
    }

    /// Accounts for an empty main-area LEB (the GC reserve).
    pub fn note_empty_leb(&mut self) {
        self.lst.empty_lebs += 1;
    }

    /// Grows the property array to cover all `main_lebs` LEBs before LPT
    /// packing.
    pub fn resize_to_main_lebs(&mut self, main_lebs: usize) {
        self.props.resize(main_lebs, Lprops::default());
    }
}
