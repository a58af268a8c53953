//! User configuration, validation and derived flash geometry.
//!
//! [`Config`] holds what the user asked for; [`Geometry::new`] applies
//! defaults, derives the journal/log/LPT sizing and the watermarks, and
//! enforces the UBIFS layout rules.  Everything downstream consumes the
//! validated [`Geometry`] only.

use std::path::PathBuf;

use log::info;

use crate::auth::HashAlgo;
use crate::compress::{Compressor, Selection};
use crate::error::{Error, Result};
use crate::format::*;
use crate::key::NameHash;
use crate::lpt::{self, LptGeometry};
use crate::util::{align_up, align_up32};

/// Number of journal heads; the image builder only ever uses the base head.
pub const JHEAD_CNT: u32 = 1;

const MAX_JRN_SIZE: u64 = 8 * 1024 * 1024;

/// Parses a byte count with an optional KiB/MiB/GiB suffix.
pub fn parse_bytes(text: &str) -> Result<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, suffix) = text.split_at(split);

    let number: u64 = digits
        .parse()
        .map_err(|_| Error::InvalidOption(format!("incorrect amount of bytes: '{text}'")))?;

    let multiplier = match suffix.trim_start() {
        "" => 1,
        "KiB" => 1024,
        "MiB" => 1024 * 1024,
        "GiB" => 1024 * 1024 * 1024,
        other => {
            return Err(Error::InvalidOption(format!(
                "bad size specifier: '{other}' - should be 'KiB', 'MiB' or 'GiB'"
            )))
        }
    };

    number
        .checked_mul(multiplier)
        .ok_or_else(|| Error::InvalidOption(format!("incorrect amount of bytes: '{text}'")))
}

/// Encryption settings.
#[derive(Clone, Debug)]
pub struct EncryptionConfig {
    pub key_file: PathBuf,
    pub key_descriptor: Option<String>,
    pub cipher: String,
    pub padding: u32,
}

/// Authentication settings.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub hash_algo: HashAlgo,
    pub key_file: PathBuf,
    pub cert_file: PathBuf,
}

/// What the user asked for.  [`Config::new`] fills in the defaults for
/// everything beyond the three mandatory geometry values.
#[derive(Clone, Debug)]
pub struct Config {
    pub root: Option<PathBuf>,
    pub min_io_size: u32,
    pub leb_size: u32,
    pub max_leb_cnt: u32,
    pub fanout: u32,
    /// Journal size in bytes (`max_bud_bytes`); derived when absent.
    pub jrn_size: Option<u64>,
    pub log_lebs: Option<u32>,
    pub orph_lebs: u32,
    /// Space reserved for the super-user, before overhead compensation.
    pub reserved: u64,
    pub compr: Option<Selection>,
    pub favor_percent: u32,
    pub key_hash: NameHash,
    pub space_fixup: bool,
    pub squash_owner: bool,
    pub set_inum_attr: bool,
    pub devtable: Option<PathBuf>,
    pub encryption: Option<EncryptionConfig>,
    pub auth: Option<AuthConfig>,
    /// Overrides the randomly generated image UUID (reproducible builds).
    pub uuid: Option<[u8; 16]>,
}

impl Config {
    pub fn new(min_io_size: u32, leb_size: u32, max_leb_cnt: u32) -> Config {
        Config {
            root: None,
            min_io_size,
            leb_size,
            max_leb_cnt,
            fanout: 8,
            jrn_size: None,
            log_lebs: None,
            orph_lebs: 1,
            reserved: 0,
            compr: None,
            favor_percent: 20,
            key_hash: NameHash::R5,
            space_fixup: false,
            squash_owner: false,
            set_inum_attr: false,
            devtable: None,
            encryption: None,
            auth: None,
            uuid: None,
        }
    }
}

fn calc_min_log_lebs(leb_size: u32, min_io_size: u32, max_bud_bytes: u64) -> u32 {
    let buds = max_bud_bytes.div_ceil(leb_size as u64);
    let mut log_size = align_up(UBIFS_REF_NODE_SZ, min_io_size as usize) as u64 * buds;
    log_size += align_up(
        UBIFS_CS_NODE_SZ + UBIFS_REF_NODE_SZ * (JHEAD_CNT as usize + 2),
        min_io_size as usize,
    ) as u64;
    log_size.div_ceil(leb_size as u64) as u32 + 1
}

/// Inflates a user-visible byte count to the physical flash space needed to
/// provide it, the inverse of the kernel's reported-space calculation.
fn add_space_overhead(size: u64, fanout: u32, hash_len: usize) -> u64 {
    let max_idx_node_sz = idx_node_sz(fanout as usize, hash_len) as u64;
    let f = if fanout > 3 { fanout as u64 >> 1 } else { 2 };
    let factor = UBIFS_MAX_DATA_NODE_SZ as u64 + max_idx_node_sz * 3 / (f - 1);
    size * factor / UBIFS_BLOCK_SIZE as u64
}

/// The validated build parameters: user configuration plus everything
/// derived from it.
#[derive(Debug)]
pub struct Geometry {
    pub min_io_size: u32,
    pub leb_size: u32,
    pub max_leb_cnt: u32,
    pub fanout: u32,
    pub log_lebs: u32,
    pub orph_lebs: u32,
    pub max_bud_bytes: u64,
    pub rp_size: u64,
    pub lsave_cnt: u32,
    pub lpt: LptGeometry,
    /// First LEB of the main area.
    pub main_first: u32,
    pub dead_wm: u32,
    pub dark_wm: u32,
    pub compr: Selection,
    pub favor_percent: u32,
    pub key_hash: NameHash,
    pub space_fixup: bool,
    pub double_hash: bool,
    pub encrypted: bool,
    pub squash_owner: bool,
    pub set_inum_attr: bool,
    /// Digest length on authenticated images, zero otherwise.
    pub hash_len: usize,
    pub root: Option<PathBuf>,
    pub devtable: Option<PathBuf>,
    pub encryption: Option<EncryptionConfig>,
    pub auth: Option<AuthConfig>,
    pub uuid: Option<[u8; 16]>,
}

impl Geometry {
    pub fn new(cfg: Config) -> Result<Geometry> {
        let encrypted = cfg.encryption.is_some();
        let double_hash = encrypted;
        let hash_len = cfg.auth.as_ref().map_or(0, |a| a.hash_algo.digest_len());

        let compr = cfg
            .compr
            .unwrap_or_else(|| Compressor::default_selection(encrypted));
        // Fails early when the selection needs an absent backend.
        Compressor::new(compr, cfg.favor_percent)?;

        let mut min_io_size = cfg.min_io_size;
        if min_io_size < 8 {
            min_io_size = 8;
        }
        let leb_size = cfg.leb_size;
        let max_leb_cnt = cfg.max_leb_cnt;

        if !min_io_size.is_power_of_two() {
            return Err(Error::geometry("min. I/O unit size should be power of 2"));
        }
        if leb_size < min_io_size {
            return Err(Error::geometry(
                "min. I/O unit cannot be larger than LEB size",
            ));
        }
        if leb_size < UBIFS_MIN_LEB_SZ {
            return Err(Error::geometry(format!(
                "too small LEB size {leb_size}, minimum is {UBIFS_MIN_LEB_SZ}"
            )));
        }
        if leb_size % min_io_size != 0 {
            return Err(Error::geometry("LEB should be multiple of min. I/O units"));
        }
        if leb_size % 8 != 0 {
            return Err(Error::geometry("LEB size has to be multiple of 8"));
        }
        if leb_size > UBIFS_MAX_LEB_SZ {
            return Err(Error::geometry(format!(
                "too large LEB size {leb_size}, maximum is {UBIFS_MAX_LEB_SZ}"
            )));
        }
        if max_leb_cnt < UBIFS_MIN_LEB_CNT {
            return Err(Error::geometry(format!(
                "too low max. count of LEBs, minimum is {UBIFS_MIN_LEB_CNT}"
            )));
        }
        if cfg.fanout < UBIFS_MIN_FANOUT {
            return Err(Error::geometry(format!(
                "too low fanout, minimum is {UBIFS_MIN_FANOUT}"
            )));
        }
        let max_fanout = (leb_size as usize - UBIFS_IDX_NODE_SZ)
            / (UBIFS_BRANCH_SZ + UBIFS_MAX_KEY_LEN);
        if cfg.fanout as usize > max_fanout {
            return Err(Error::geometry(format!(
                "too high fanout, maximum is {max_fanout}"
            )));
        }

        let max_bud_bytes = match cfg.jrn_size {
            Some(size) => size,
            None => {
                let mut lebs = max_leb_cnt as i64 - (UBIFS_SB_LEBS + UBIFS_MST_LEBS) as i64;
                lebs -= cfg.orph_lebs as i64;
                lebs -= cfg.log_lebs.unwrap_or(UBIFS_MIN_LOG_LEBS) as i64;
                lebs -= UBIFS_MIN_LPT_LEBS as i64;
                // About 12.5% of the main area, clamped to [4 LEBs, 8 MiB].
                let mut bud = (lebs.max(0) as u64 / 8) * leb_size as u64;
                if bud > MAX_JRN_SIZE {
                    bud = MAX_JRN_SIZE;
                }
                if bud < 4 * leb_size as u64 {
                    bud = 4 * leb_size as u64;
                }
                bud
            }
        };

        let min_log_lebs = calc_min_log_lebs(leb_size, min_io_size, max_bud_bytes);
        let log_lebs = cfg.log_lebs.unwrap_or(min_log_lebs + 2);

        if log_lebs < UBIFS_MIN_LOG_LEBS {
            return Err(Error::geometry(format!(
                "too few log LEBs, minimum is {UBIFS_MIN_LOG_LEBS}"
            )));
        }
        if log_lebs >= max_leb_cnt - UBIFS_MIN_LEB_CNT {
            return Err(Error::geometry(format!(
                "too many log LEBs, maximum is {}",
                max_leb_cnt - UBIFS_MIN_LEB_CNT
            )));
        }
        if log_lebs < min_log_lebs {
            return Err(Error::geometry(format!(
                "too few log LEBs, expected at least {min_log_lebs}"
            )));
        }
        if cfg.orph_lebs < UBIFS_MIN_ORPH_LEBS {
            return Err(Error::geometry(format!(
                "too few orphan LEBs, minimum is {UBIFS_MIN_ORPH_LEBS}"
            )));
        }
        if cfg.orph_lebs >= max_leb_cnt - UBIFS_MIN_LEB_CNT {
            return Err(Error::geometry(format!(
                "too many orphan LEBs, maximum is {}",
                max_leb_cnt - UBIFS_MIN_LEB_CNT
            )));
        }

        let lsave_cnt = UBIFS_DEFAULT_LSAVE_CNT;
        let avail = max_leb_cnt
            .checked_sub(UBIFS_SB_LEBS + UBIFS_MST_LEBS + log_lebs + cfg.orph_lebs)
            .ok_or_else(|| Error::geometry("too low max. count of LEBs"))?;
        let (lpt_geom, _main_lebs) =
            lpt::calc_geometry(leb_size, min_io_size, max_leb_cnt, avail, lsave_cnt)?;

        let need = UBIFS_SB_LEBS
            + UBIFS_MST_LEBS
            + log_lebs
            + lpt_geom.lpt_lebs
            + cfg.orph_lebs
            + 4;
        if need > max_leb_cnt {
            return Err(Error::geometry(format!(
                "too low max. count of LEBs, expected at least {need}"
            )));
        }

        let rp_size = add_space_overhead(cfg.reserved, cfg.fanout, hash_len);
        if rp_size >= (leb_size as u64) * (max_leb_cnt as u64) / 2 {
            return Err(Error::geometry(format!(
                "too much reserved space {rp_size}"
            )));
        }

        let main_first = UBIFS_LOG_LNUM + log_lebs + lpt_geom.lpt_lebs + cfg.orph_lebs;
        let dead_wm = align_up32(MIN_WRITE_SZ as u32, min_io_size);
        let dark_wm = align_up32(UBIFS_MAX_NODE_SZ as u32, min_io_size);

        let geo = Geometry {
            min_io_size,
            leb_size,
            max_leb_cnt,
            fanout: cfg.fanout,
            log_lebs,
            orph_lebs: cfg.orph_lebs,
            max_bud_bytes,
            rp_size,
            lsave_cnt,
            lpt: lpt_geom,
            main_first,
            dead_wm,
            dark_wm,
            compr,
            favor_percent: cfg.favor_percent,
            key_hash: cfg.key_hash,
            space_fixup: cfg.space_fixup,
            double_hash,
            encrypted,
            squash_owner: cfg.squash_owner,
            set_inum_attr: cfg.set_inum_attr,
            hash_len,
            root: cfg.root,
            devtable: cfg.devtable,
            encryption: cfg.encryption,
            auth: cfg.auth,
            uuid: cfg.uuid,
        };

        info!(
            "geometry: min_io {} leb_size {} max_leb_cnt {} log_lebs {} lpt_lebs {} orph_lebs {} main_first {} jrn {} rp {}",
            geo.min_io_size,
            geo.leb_size,
            geo.max_leb_cnt,
            geo.log_lebs,
            geo.lpt.lpt_lebs,
            geo.orph_lebs,
            geo.main_first,
            geo.max_bud_bytes,
            geo.rp_size,
        );

        Ok(geo)
    }

    /// On-flash format version: 5 with double-hashed or encrypted images,
    /// 4 otherwise.
    pub fn fmt_version(&self) -> u32 {
        if self.double_hash || self.encrypted {
            5
        } else {
            4
        }
    }

    pub fn key_hash_code(&self) -> u8 {
        match self.key_hash {
            NameHash::R5 => UBIFS_KEY_HASH_R5,
            NameHash::Test => UBIFS_KEY_HASH_TEST,
        }
    }

    pub fn authenticated(&self) -> bool {
        self.auth.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_bytes("2048").unwrap(), 2048);
        assert_eq!(parse_bytes("124KiB").unwrap(), 126976);
        assert_eq!(parse_bytes("124 KiB").unwrap(), 126976);
        assert_eq!(parse_bytes("8MiB").unwrap(), 8 * 1024 * 1024);
        assert_eq!(parse_bytes("1GiB").unwrap(), 1 << 30);
        assert!(parse_bytes("12kb").is_err());
        assert!(parse_bytes("garbage").is_err());
        assert!(parse_bytes("-3").is_err());
    }

    #[test]
    fn test_derived_defaults() {
        let geo = Geometry::new(Config::new(2048, 126976, 100)).unwrap();

        // 12.5% of (100 - 1 - 2 - 1 - 2 - 2) = 92 LEBs
        assert_eq!(geo.max_bud_bytes, 11 * 126976);
        assert_eq!(geo.log_lebs, 4);
        assert_eq!(geo.lpt.lpt_lebs, 2);
        assert!(!geo.lpt.big_lpt);
        assert_eq!(geo.orph_lebs, 1);
        assert_eq!(geo.main_first, 3 + 4 + 2 + 1);
        assert_eq!(geo.dead_wm, 2048);
        assert_eq!(geo.dark_wm, 6144);
        assert_eq!(geo.fmt_version(), 4);
        assert_eq!(geo.key_hash_code(), UBIFS_KEY_HASH_R5);
        assert_eq!(geo.rp_size, 0);
    }

    #[test]
    fn test_tiny_min_io_rounds_up() {
        let geo = Geometry::new(Config::new(1, 15360, 100)).unwrap();
        assert_eq!(geo.min_io_size, 8);
    }

    #[test]
    fn test_add_space_overhead() {
        // fanout 8: idx node 188 bytes, f - 1 = 3
        assert_eq!(
            add_space_overhead(1024 * 1024, 8, 0),
            (1024 * 1024 / 4096) * (4144 + 188)
        );
        assert_eq!(add_space_overhead(0, 8, 0), 0);
    }

    #[test]
    fn test_validation_failures() {
        let bad = |f: fn(&mut Config)| {
            let mut cfg = Config::new(2048, 126976, 100);
            f(&mut cfg);
            assert!(matches!(
                Geometry::new(cfg),
                Err(Error::InvalidGeometry { .. })
            ));
        };

        bad(|c| c.min_io_size = 3000); // not a power of two
        bad(|c| c.leb_size = 8192); // below the minimum LEB size
        bad(|c| c.leb_size = 4 * 1024 * 1024); // above the maximum
        bad(|c| c.leb_size = 126976 + 4); // not a multiple of min_io
        bad(|c| c.max_leb_cnt = 10); // below the minimum LEB count
        bad(|c| c.fanout = 2); // below the minimum fanout
        bad(|c| c.fanout = 100000); // above what a LEB can hold
        bad(|c| c.orph_lebs = 95); // orphan area leaves no room
        bad(|c| c.log_lebs = Some(1)); // below the minimum log size
        bad(|c| c.reserved = 1 << 40); // absurd reserved space
    }

    #[test]
    fn test_fmt_version_5_with_encryption() {
        let mut cfg = Config::new(2048, 126976, 100);
        cfg.encryption = Some(EncryptionConfig {
            key_file: "/nonexistent".into(),
            key_descriptor: None,
            cipher: "AES-256-XTS".into(),
            padding: 4,
        });
        // Key material is loaded later; geometry only derives the flags.
        let geo = Geometry::new(cfg).unwrap();
        assert!(geo.encrypted);
        assert!(geo.double_hash);
        assert_eq!(geo.fmt_version(), 5);
        assert_eq!(geo.compr, Selection::None);
    }
}
