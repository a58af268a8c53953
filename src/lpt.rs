//! The LEB Properties Tree.
//!
//! The LPT records the `(free, dirty, flags)` triple of every main-area LEB
//! in a bit-packed tree of pnodes (leaves, four LEBs each) under nnodes
//! (internal, four branches each), together with the LPT area's own
//! properties table (ltab) and, in the "big" form, a save table (lsave).
//! Field widths are derived from the geometry, so the same structures pack
//! differently on every image.

use crate::auth::Authenticator;
use crate::crc::crc16;
use crate::error::{Error, Result};
use crate::format::UBIFS_MAX_HASH_LEN;
use crate::lprops::{Lprops, LPROPS_INDEX};
use crate::util::{align_up, align_up32};

pub const UBIFS_LPT_FANOUT: usize = 4;
pub const UBIFS_LPT_FANOUT_SHIFT: usize = 2;
pub const UBIFS_LPT_CRC_BITS: usize = 16;
pub const UBIFS_LPT_CRC_BYTES: usize = 2;
pub const UBIFS_LPT_TYPE_BITS: usize = 4;

pub const UBIFS_LPT_PNODE: u32 = 0;
pub const UBIFS_LPT_NNODE: u32 = 1;
pub const UBIFS_LPT_LTAB: u32 = 2;
pub const UBIFS_LPT_LSAVE: u32 = 3;

/// "Find last set": the number of bits needed to represent `x`.
fn fls(x: u32) -> usize {
    (32 - x.leading_zeros()) as usize
}

/// The derived LPT geometry: area size, node sizes and bit widths.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LptGeometry {
    pub lpt_lebs: u32,
    pub big_lpt: bool,
    pub pnode_sz: usize,
    pub nnode_sz: usize,
    pub ltab_sz: usize,
    pub lsave_sz: usize,
    pub pnode_cnt: usize,
    pub nnode_cnt: usize,
    pub lpt_hght: usize,
    pub space_bits: usize,
    pub lpt_lnum_bits: usize,
    pub lpt_offs_bits: usize,
    pub lpt_spc_bits: usize,
    pub pcnt_bits: usize,
    pub lnum_bits: usize,
    pub lsave_cnt: usize,
    pub lpt_sz: u64,
}

fn do_calc_lpt_geom(
    leb_size: u32,
    min_io_size: u32,
    max_leb_cnt: u32,
    main_lebs: u32,
    lpt_lebs: u32,
    big_lpt: bool,
    lsave_cnt: u32,
) -> LptGeometry {
    let max_pnode_cnt = (main_lebs as usize).div_ceil(UBIFS_LPT_FANOUT);

    let mut lpt_hght = 1;
    let mut n = UBIFS_LPT_FANOUT;
    while n < max_pnode_cnt {
        lpt_hght += 1;
        n <<= UBIFS_LPT_FANOUT_SHIFT;
    }

    let pnode_cnt = (main_lebs as usize).div_ceil(UBIFS_LPT_FANOUT);

    let mut n = pnode_cnt.div_ceil(UBIFS_LPT_FANOUT);
    let mut nnode_cnt = n;
    for _ in 1..lpt_hght {
        n = n.div_ceil(UBIFS_LPT_FANOUT);
        nnode_cnt += n;
    }

    let space_bits = fls(leb_size) - 3;
    let lpt_lnum_bits = fls(lpt_lebs);
    let lpt_offs_bits = fls(leb_size - 1);
    let lpt_spc_bits = fls(leb_size);
    let pcnt_bits = fls(max_leb_cnt.div_ceil(UBIFS_LPT_FANOUT as u32) - 1);
    let lnum_bits = fls(max_leb_cnt - 1);

    let num_bits = if big_lpt { pcnt_bits } else { 0 };

    let bits = UBIFS_LPT_CRC_BITS
        + UBIFS_LPT_TYPE_BITS
        + num_bits
        + (space_bits * 2 + 1) * UBIFS_LPT_FANOUT;
    let pnode_sz = bits.div_ceil(8);

    let bits = UBIFS_LPT_CRC_BITS
        + UBIFS_LPT_TYPE_BITS
        + num_bits
        + (lpt_lnum_bits + lpt_offs_bits) * UBIFS_LPT_FANOUT;
    let nnode_sz = bits.div_ceil(8);

    let bits = UBIFS_LPT_CRC_BITS + UBIFS_LPT_TYPE_BITS + lpt_lebs as usize * lpt_spc_bits * 2;
    let ltab_sz = bits.div_ceil(8);

    let bits = UBIFS_LPT_CRC_BITS + UBIFS_LPT_TYPE_BITS + lnum_bits * lsave_cnt as usize;
    let lsave_sz = bits.div_ceil(8);

    let mut lpt_sz = pnode_cnt as u64 * pnode_sz as u64 + nnode_cnt as u64 * nnode_sz as u64;
    lpt_sz += ltab_sz as u64;
    if big_lpt {
        lpt_sz += lsave_sz as u64;
    }

    // Per-LEB wastage: the largest node that may not fit at a LEB tail.
    let per_leb_wastage = pnode_sz.max(nnode_sz) as u64;
    let mut sz = lpt_sz + per_leb_wastage;
    let mut tot_wastage = per_leb_wastage;
    while sz > leb_size as u64 {
        sz += per_leb_wastage;
        sz -= leb_size as u64;
        tot_wastage += per_leb_wastage;
    }
    tot_wastage += align_up(sz as usize, min_io_size as usize) as u64 - sz;
    lpt_sz += tot_wastage;

    LptGeometry {
        lpt_lebs,
        big_lpt,
        pnode_sz,
        nnode_sz,
        ltab_sz,
        lsave_sz,
        pnode_cnt,
        nnode_cnt,
        lpt_hght,
        space_bits,
        lpt_lnum_bits,
        lpt_offs_bits,
        lpt_spc_bits,
        pcnt_bits,
        lnum_bits,
        lsave_cnt: lsave_cnt as usize,
        lpt_sz,
    }
}

/// Computes the default LPT geometry: start from the minimum LPT area and
/// the small form, switching to the big form or growing the area when the
/// table does not fit.  Returns the geometry and the resulting main-area
/// LEB count.
pub fn calc_geometry(
    leb_size: u32,
    min_io_size: u32,
    max_leb_cnt: u32,
    avail_lebs: u32,
    lsave_cnt: u32,
) -> Result<(LptGeometry, u32)> {
    let too_few = || Error::geometry("too few LEBs left for the main area");

    let mut lpt_lebs = crate::format::UBIFS_MIN_LPT_LEBS;
    let mut main_lebs = avail_lebs.checked_sub(lpt_lebs).filter(|&n| n > 0).ok_or_else(too_few)?;

    let mut geom = do_calc_lpt_geom(
        leb_size, min_io_size, max_leb_cnt, main_lebs, lpt_lebs, false, lsave_cnt,
    );

    if geom.lpt_sz > leb_size as u64 {
        geom = do_calc_lpt_geom(
            leb_size, min_io_size, max_leb_cnt, main_lebs, lpt_lebs, true, lsave_cnt,
        );
    }

    let mut lebs_needed = geom.lpt_sz.div_ceil(leb_size as u64) as u32;
    if lebs_needed > lpt_lebs {
        lpt_lebs = lebs_needed;
        main_lebs = avail_lebs.checked_sub(lpt_lebs).filter(|&n| n > 0).ok_or_else(too_few)?;
        geom = do_calc_lpt_geom(
            leb_size, min_io_size, max_leb_cnt, main_lebs, lpt_lebs, geom.big_lpt, lsave_cnt,
        );
        lebs_needed = geom.lpt_sz.div_ceil(leb_size as u64) as u32;
        if lebs_needed > lpt_lebs {
            return Err(Error::geometry("LPT does not fit in its area"));
        }
    }

    Ok((geom, main_lebs))
}

/// Packs values LSB-first into a byte stream, the LPT bit order.
struct BitWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> BitWriter<'a> {
    fn new(buf: &'a mut [u8]) -> BitWriter<'a> {
        BitWriter { buf, pos: 0 }
    }

    fn put(&mut self, val: u32, nrbits: usize) {
        debug_assert!(nrbits <= 32);
        debug_assert!(nrbits == 32 || val < (1 << nrbits));
        for i in 0..nrbits {
            if (val >> i) & 1 != 0 {
                let bit = self.pos + i;
                self.buf[bit >> 3] |= 1 << (bit & 7);
            }
        }
        self.pos += nrbits;
    }
}

/// Seals an LPT node: CRC-16 over the body, packed into the leading bytes.
fn seal(buf: &mut [u8]) {
    let crc = crc16(0xFFFF, &buf[UBIFS_LPT_CRC_BYTES..]);
    let mut bw = BitWriter::new(buf);
    bw.put(crc as u32, UBIFS_LPT_CRC_BITS);
}

/// Positions recorded while writing the LPT, needed by the master node.
#[derive(Clone, Copy, Debug)]
pub struct LptResult {
    pub lpt_lnum: u32,
    pub lpt_offs: u32,
    pub nhead_lnum: u32,
    pub nhead_offs: u32,
    pub ltab_lnum: u32,
    pub ltab_offs: u32,
    pub lsave_lnum: u32,
    pub lsave_offs: u32,
    pub hash: [u8; UBIFS_MAX_HASH_LEN],
}

impl Default for LptResult {
    fn default() -> Self {
        LptResult {
            lpt_lnum: 0,
            lpt_offs: 0,
            nhead_lnum: 0,
            nhead_offs: 0,
            ltab_lnum: 0,
            ltab_offs: 0,
            lsave_lnum: 0,
            lsave_offs: 0,
            hash: [0; UBIFS_MAX_HASH_LEN],
        }
    }
}

fn calc_nnode_num(row: usize, mut col: usize) -> u32 {
    let mut num: u32 = 1;
    for _ in 0..row {
        let bits = (col & (UBIFS_LPT_FANOUT - 1)) as u32;
        col >>= UBIFS_LPT_FANOUT_SHIFT;
        num <<= UBIFS_LPT_FANOUT_SHIFT;
        num |= bits;
    }
    num
}

/// Writes the LPT area.  `write_leb` receives the used prefix of each LEB
/// (the caller pads to the full LEB with 0xFF); LPT LEBs past the head are
/// written empty.
#[allow(clippy::too_many_arguments)]
pub fn write_lpt(
    geom: &LptGeometry,
    leb_size: u32,
    min_io_size: u32,
    lpt_first: u32,
    main_first: u32,
    main_lebs: usize,
    props: &[Lprops],
    auth: Option<&Authenticator>,
    write_leb: &mut dyn FnMut(u32, &[u8]) -> Result<()>,
) -> Result<LptResult> {
    let leb_size = leb_size as usize;
    let min_io = min_io_size as usize;
    let mut result = LptResult::default();

    // The LPT area's own properties table.
    let mut ltab: Vec<(u32, u32)> = vec![(leb_size as u32, 0); geom.lpt_lebs as usize];
    let set_ltab = |ltab: &mut Vec<(u32, u32)>, lnum: u32, free: u32, dirty: u32| {
        let entry = &mut ltab[(lnum - lpt_first) as usize];
        entry.0 = free;
        entry.1 += dirty;
    };

    let mut buf = vec![0u8; leb_size];
    let mut lnum = lpt_first;
    let mut len: usize = 0;

    let cnt = main_lebs.div_ceil(UBIFS_LPT_FANOUT);
    debug_assert_eq!(cnt, geom.pnode_cnt);

    // Position of the level below, replayed when filling nnode branches.
    let mut blnum = lnum;
    let mut boffs: usize = 0;
    let mut bcnt = cnt;
    let mut bsz = geom.pnode_sz;

    let mut pnode_stream = Vec::new();

    macro_rules! flush_if_needed {
        ($node_sz:expr) => {
            if len + $node_sz > leb_size {
                let alen = align_up(len, min_io);
                set_ltab(&mut ltab, lnum, (leb_size - alen) as u32, (alen - len) as u32);
                buf[len..alen].fill(0xFF);
                write_leb(lnum, &buf[..alen])?;
                lnum += 1;
                buf.fill(0);
                len = 0;
            }
        };
    }

    // Pnodes: four main-area LEBs each, missing tail entries read as empty.
    for i in 0..cnt {
        flush_if_needed!(geom.pnode_sz);

        let node = &mut buf[len..len + geom.pnode_sz];
        {
            let mut bw = BitWriter::new(&mut node[UBIFS_LPT_CRC_BYTES..]);
            bw.put(UBIFS_LPT_PNODE, UBIFS_LPT_TYPE_BITS);
            if geom.big_lpt {
                bw.put(i as u32, geom.pcnt_bits);
            }
            for j in 0..UBIFS_LPT_FANOUT {
                let k = i * UBIFS_LPT_FANOUT + j;
                let lp = if k < main_lebs {
                    props[k]
                } else {
                    Lprops {
                        free: leb_size as u32,
                        dirty: 0,
                        flags: 0,
                    }
                };
                bw.put(lp.free >> 3, geom.space_bits);
                bw.put(lp.dirty >> 3, geom.space_bits);
                bw.put((lp.flags & LPROPS_INDEX != 0) as u32, 1);
            }
        }
        seal(node);
        pnode_stream.extend_from_slice(node);
        len += geom.pnode_sz;
    }

    // Nnodes, bottom row up.  Row zero is the root.
    let mut row = 0;
    let mut n = UBIFS_LPT_FANOUT;
    while cnt > n {
        row += 1;
        n <<= UBIFS_LPT_FANOUT_SHIFT;
    }

    let mut cnt = cnt;
    loop {
        cnt = cnt.div_ceil(UBIFS_LPT_FANOUT).max(1);
        for i in 0..cnt {
            flush_if_needed!(geom.nnode_sz);

            if row == 0 && i == 0 {
                result.lpt_lnum = lnum;
                result.lpt_offs = len as u32;
            }

            let node = &mut buf[len..len + geom.nnode_sz];
            {
                let mut bw = BitWriter::new(&mut node[UBIFS_LPT_CRC_BYTES..]);
                bw.put(UBIFS_LPT_NNODE, UBIFS_LPT_TYPE_BITS);
                if geom.big_lpt {
                    bw.put(calc_nnode_num(row, i), geom.pcnt_bits);
                }
                for _ in 0..UBIFS_LPT_FANOUT {
                    let (branch_lnum, branch_offs) = if bcnt > 0 {
                        if boffs + bsz > leb_size {
                            blnum += 1;
                            boffs = 0;
                        }
                        let branch = (blnum, boffs);
                        boffs += bsz;
                        bcnt -= 1;
                        branch
                    } else {
                        (0, 0)
                    };
                    let encoded = if branch_lnum != 0 {
                        branch_lnum - lpt_first + 1
                    } else {
                        0
                    };
                    bw.put(encoded, geom.lpt_lnum_bits);
                    bw.put(branch_offs as u32, geom.lpt_offs_bits);
                }
            }
            seal(node);
            len += geom.nnode_sz;
        }
        if row == 0 {
            break;
        }
        bcnt = cnt;
        bsz = geom.nnode_sz;
        row -= 1;
    }

    if geom.big_lpt {
        flush_if_needed!(geom.lsave_sz);
        result.lsave_lnum = lnum;
        result.lsave_offs = len as u32;

        let node = &mut buf[len..len + geom.lsave_sz];
        {
            let mut bw = BitWriter::new(&mut node[UBIFS_LPT_CRC_BYTES..]);
            bw.put(UBIFS_LPT_LSAVE, UBIFS_LPT_TYPE_BITS);
            for i in 0..geom.lsave_cnt {
                let save = if i < main_lebs {
                    main_first + i as u32
                } else {
                    main_first
                };
                bw.put(save, geom.lnum_bits);
            }
        }
        seal(node);
        len += geom.lsave_sz;
    }

    flush_if_needed!(geom.ltab_sz);
    result.ltab_lnum = lnum;
    result.ltab_offs = len as u32;

    // The ltab records its own LEB's final usage, so update it before
    // packing.
    let ltab_start = len;
    len += geom.ltab_sz;
    let alen = align_up(len, min_io);
    set_ltab(&mut ltab, lnum, (leb_size - alen) as u32, (alen - len) as u32);

    let node = &mut buf[ltab_start..ltab_start + geom.ltab_sz];
    {
        let mut bw = BitWriter::new(&mut node[UBIFS_LPT_CRC_BYTES..]);
        bw.put(UBIFS_LPT_LTAB, UBIFS_LPT_TYPE_BITS);
        for &(free, dirty) in ltab.iter() {
            bw.put(free, geom.lpt_spc_bits);
            bw.put(dirty, geom.lpt_spc_bits);
        }
    }
    seal(node);

    buf[len..alen].fill(0xFF);
    write_leb(lnum, &buf[..alen])?;

    result.nhead_lnum = lnum;
    result.nhead_offs = align_up32(len as u32, min_io_size);

    let lpt_last = lpt_first + geom.lpt_lebs - 1;
    for empty in lnum + 1..=lpt_last {
        write_leb(empty, &[])?;
    }

    if let Some(auth) = auth {
        auth.node_hash(&pnode_stream, &mut result.hash)?;
    }

    Ok(result)
}
