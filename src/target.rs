//! Output targets: a regular image file or a UBI volume.
//!
//! The builder hands every LEB to the target as a full `leb_size` buffer
//! (already padded with 0xFF), in whatever order finalization requires.
//! The file target seeks; the UBI target issues a LEB-change per write.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::Path;

use log::debug;

use crate::error::{Error, Result};
use crate::util::read_sysfs_u32;

/// A sink for logical erase blocks.  The sink never sees a partial LEB.
pub trait Target {
    /// Writes the full contents of LEB `lnum`.
    fn leb_change(&mut self, lnum: u32, buf: &[u8]) -> Result<()>;

    /// Completes the image once the final LEB count is known.
    fn finish(&mut self, leb_cnt: u32) -> Result<()>;
}

/// A seekable regular file.  LEBs may arrive out of order; LEBs never
/// written become 0xFF-filled when the image is finished.
pub struct FileTarget {
    file: File,
    leb_size: u32,
    written: Vec<bool>,
}

impl FileTarget {
    pub fn create(path: &Path, leb_size: u32) -> Result<FileTarget> {
        let file = File::create(path).map_err(|e| Error::source_io(path, e))?;
        Ok(FileTarget::new(file, leb_size))
    }

    pub fn new(file: File, leb_size: u32) -> FileTarget {
        FileTarget {
            file,
            leb_size,
            written: Vec::new(),
        }
    }
}

impl Target for FileTarget {
    fn leb_change(&mut self, lnum: u32, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.leb_size as usize);
        let offset = lnum as u64 * self.leb_size as u64;
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(buf))
            .map_err(|e| Error::sink_io(lnum, e))?;

        if self.written.len() <= lnum as usize {
            self.written.resize(lnum as usize + 1, false);
        }
        self.written[lnum as usize] = true;
        Ok(())
    }

    fn finish(&mut self, leb_cnt: u32) -> Result<()> {
        let blank = vec![0xFFu8; self.leb_size as usize];
        for lnum in 0..leb_cnt {
            let done = self.written.get(lnum as usize).copied().unwrap_or(false);
            if !done {
                debug!("filling untouched LEB {lnum}");
                let offset = lnum as u64 * self.leb_size as u64;
                self.file
                    .seek(SeekFrom::Start(offset))
                    .and_then(|_| self.file.write_all(&blank))
                    .map_err(|e| Error::sink_io(lnum, e))?;
            }
        }
        self.file
            .set_len(leb_cnt as u64 * self.leb_size as u64)
            .and_then(|_| self.file.sync_all())
            .map_err(|e| Error::sink_io(leb_cnt, e))?;
        Ok(())
    }
}

#[allow(non_camel_case_types)]
mod ioctl {
    //! The UBI character device ioctl for atomically changing a LEB.

    use nix::ioctl_write_ptr;

    pub const UBI_IOC_MAGIC: u8 = b'O';
    pub const UBI_UNKNOWN: i8 = 3;

    #[repr(C)]
    pub struct ubi_leb_change_req {
        pub lnum: i32,
        pub bytes: i32,
        pub dtype: i8,
        pub padding: [i8; 7],
    }

    ioctl_write_ptr!(leb_change_start, UBI_IOC_MAGIC, 2, ubi_leb_change_req);
}

/// An open UBI volume (e.g. `/dev/ubi0_0`).  The volume reports its own
/// LEB and min-I/O geometry through sysfs, which overrides the
/// corresponding options.
pub struct UbiVolume {
    file: File,
    pub leb_size: u32,
    pub min_io_size: u32,
}

impl UbiVolume {
    /// Returns true if `path` looks like a UBI volume character device.
    pub fn is_ubi_volume(path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        std::fs::metadata(format!("/sys/class/ubi/{name}")).is_ok()
    }

    pub fn open(path: &Path) -> Result<UbiVolume> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidOption(format!("bad UBI volume path '{}'", path.display())))?;
        let device = name.split('_').next().unwrap_or(name);

        let leb_size = read_sysfs_u32(&format!("/sys/class/ubi/{name}/usable_eb_size"))
            .map_err(|e| Error::source_io(path, e))?;
        let min_io_size = read_sysfs_u32(&format!("/sys/class/ubi/{device}/min_io_size"))
            .map_err(|e| Error::source_io(path, e))?;

        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::source_io(path, e))?;

        Ok(UbiVolume {
            file,
            leb_size,
            min_io_size,
        })
    }
}

impl Target for UbiVolume {
    fn leb_change(&mut self, lnum: u32, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.leb_size as usize);
        let req = ioctl::ubi_leb_change_req {
            lnum: lnum as i32,
            bytes: buf.len() as i32,
            dtype: ioctl::UBI_UNKNOWN,
            padding: [0; 7],
        };
        unsafe { ioctl::leb_change_start(self.file.as_raw_fd(), &req) }
            .map_err(|e| Error::sink_io(lnum, std::io::Error::from(e)))?;
        self.file
            .write_all(buf)
            .map_err(|e| Error::sink_io(lnum, e))?;
        Ok(())
    }

    fn finish(&mut self, _leb_cnt: u32) -> Result<()> {
        self.file.sync_all().map_err(|e| Error::sink_io(0, e))
    }
}
