//! The compression capability.
//!
//! Data blocks shorter than [`UBIFS_MIN_COMPR_LEN`] are stored as-is, and any
//! block the selected backend cannot shrink is stored uncompressed.  The
//! `favor_lzo` mode runs both LZO and zlib and keeps LZO unless zlib wins by
//! more than the configured percentage.
//!
//! LZO is a build-time capability (the `lzo` cargo feature); a build without
//! it rejects the corresponding options at validation time.

use flate2::{Compress, Compression, FlushCompress, Status};

use crate::error::{Error, Result};

/// Blocks shorter than this are never compressed.
pub const UBIFS_MIN_COMPR_LEN: usize = 128;

/* On-flash compressor identifiers */
pub const UBIFS_COMPR_NONE: u16 = 0;
pub const UBIFS_COMPR_LZO: u16 = 1;
pub const UBIFS_COMPR_ZLIB: u16 = 2;
pub const UBIFS_COMPR_ZSTD: u16 = 3;

/// The compressor selected by configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selection {
    None,
    Lzo,
    Zlib,
    Zstd,
    FavorLzo,
}

impl Selection {
    pub fn from_name(name: &str) -> Option<Selection> {
        match name {
            "none" => Some(Selection::None),
            "lzo" => Some(Selection::Lzo),
            "zlib" => Some(Selection::Zlib),
            "zstd" => Some(Selection::Zstd),
            "favor_lzo" => Some(Selection::FavorLzo),
            _ => None,
        }
    }
}

/// Decides the favor-LZO arbitration: zlib is taken only when
/// `zlib_len * 100 < (100 - favor_percent) * lzo_len`, in integer arithmetic.
pub fn favor_picks_zlib(lzo_len: usize, zlib_len: usize, favor_percent: u32) -> bool {
    if lzo_len <= zlib_len {
        return false;
    }
    (zlib_len as u64) * 100 < (100 - favor_percent as u64) * lzo_len as u64
}

fn zlib_deflate(data: &[u8]) -> Result<Option<Vec<u8>>> {
    // Match the zlib parameters used by the kernel crypto API: raw deflate
    // with an 11-bit window.
    let mut c = Compress::new_with_window_bits(Compression::default(), false, 11);
    let mut out = Vec::with_capacity(data.len());
    match c.compress_vec(data, &mut out, FlushCompress::Finish) {
        Ok(Status::StreamEnd) => Ok(Some(out)),
        // The output did not fit within the input size, so it cannot win.
        Ok(Status::Ok) | Ok(Status::BufError) => Ok(None),
        Err(e) => Err(Error::CompressionFailed(e.to_string())),
    }
}

fn zstd_compress(data: &[u8]) -> Result<Option<Vec<u8>>> {
    match zstd::bulk::compress(data, 0) {
        Ok(out) => Ok(Some(out)),
        Err(e) => Err(Error::CompressionFailed(e.to_string())),
    }
}

#[cfg(feature = "lzo")]
fn lzo_compress(data: &[u8]) -> Result<Option<Vec<u8>>> {
    match lzokay::compress::compress(data) {
        Ok(out) => Ok(Some(out)),
        Err(e) => Err(Error::CompressionFailed(format!("lzo: {e:?}"))),
    }
}

#[cfg(not(feature = "lzo"))]
fn lzo_compress(_data: &[u8]) -> Result<Option<Vec<u8>>> {
    Err(Error::InvalidOption(
        "built without LZO support".to_string(),
    ))
}

/// A configured compressor.
#[derive(Clone, Copy, Debug)]
pub struct Compressor {
    selection: Selection,
    favor_percent: u32,
}

impl Compressor {
    pub fn new(selection: Selection, favor_percent: u32) -> Result<Compressor> {
        if !cfg!(feature = "lzo") && matches!(selection, Selection::Lzo | Selection::FavorLzo) {
            return Err(Error::InvalidOption(
                "compressor requires LZO, but this build lacks it".to_string(),
            ));
        }
        if matches!(selection, Selection::FavorLzo) && !(1..100).contains(&favor_percent) {
            return Err(Error::InvalidOption(format!(
                "bad favor LZO percent {favor_percent}"
            )));
        }
        Ok(Compressor {
            selection,
            favor_percent,
        })
    }

    /// The default selection when the user did not pick one: no compression
    /// on encrypted images, else the first available of LZO and zlib.
    pub fn default_selection(encrypted: bool) -> Selection {
        if encrypted {
            Selection::None
        } else if cfg!(feature = "lzo") {
            Selection::Lzo
        } else {
            Selection::Zlib
        }
    }

    /// The selection used for files carrying the host "compress" attribute
    /// when the image default is `none`.
    pub fn forced_selection() -> Selection {
        if cfg!(feature = "lzo") {
            Selection::Lzo
        } else {
            Selection::Zlib
        }
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    /// The compressor identifier recorded in the superblock and in inodes.
    pub fn on_flash_default(&self) -> u16 {
        match self.selection {
            Selection::None => UBIFS_COMPR_NONE,
            Selection::Lzo | Selection::FavorLzo => UBIFS_COMPR_LZO,
            Selection::Zlib => UBIFS_COMPR_ZLIB,
            Selection::Zstd => UBIFS_COMPR_ZSTD,
        }
    }

    /// Compresses one data block with the configured selection, returning
    /// the on-flash compressor identifier and the payload to store.
    pub fn compress(&self, data: &[u8]) -> Result<(u16, Vec<u8>)> {
        self.compress_as(self.selection, data)
    }

    /// Like [`Self::compress`] but with an explicit selection.
    pub fn compress_as(&self, selection: Selection, data: &[u8]) -> Result<(u16, Vec<u8>)> {
        if data.len() < UBIFS_MIN_COMPR_LEN {
            return Ok((UBIFS_COMPR_NONE, data.to_vec()));
        }

        let (compr_type, out) = match selection {
            Selection::None => (UBIFS_COMPR_NONE, None),
            Selection::Lzo => (UBIFS_COMPR_LZO, lzo_compress(data)?),
            Selection::Zlib => (UBIFS_COMPR_ZLIB, zlib_deflate(data)?),
            Selection::Zstd => (UBIFS_COMPR_ZSTD, zstd_compress(data)?),
            Selection::FavorLzo => {
                let lzo = lzo_compress(data)?;
                let zlib = zlib_deflate(data)?;
                match (lzo, zlib) {
                    (Some(l), Some(z)) => {
                        if favor_picks_zlib(l.len(), z.len(), self.favor_percent) {
                            (UBIFS_COMPR_ZLIB, Some(z))
                        } else {
                            (UBIFS_COMPR_LZO, Some(l))
                        }
                    }
                    (Some(l), None) => (UBIFS_COMPR_LZO, Some(l)),
                    (None, Some(z)) => (UBIFS_COMPR_ZLIB, Some(z)),
                    (None, None) => (UBIFS_COMPR_NONE, None),
                }
            }
        };

        match out {
            Some(out) if out.len() < data.len() => Ok((compr_type, out)),
            _ => Ok((UBIFS_COMPR_NONE, data.to_vec())),
        }
    }
}
