use std::{
    io::{Error, ErrorKind, Read, Result},
    os::fd::{AsFd, AsRawFd},
};

/// Rounds `n` up to the next multiple of `alignment`.  `alignment` must be a
/// power of two.
pub fn align_up(n: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (n + alignment - 1) & !(alignment - 1)
}

/// Like [`align_up`] but for `u32` quantities (LEB offsets and sizes).
pub fn align_up32(n: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (n + alignment - 1) & !(alignment - 1)
}

/// Formats a string like "/proc/self/fd/3" for the given fd.  This can be used to work with kernel
/// APIs that don't directly accept file descriptors.
///
/// This call never fails.
pub(crate) fn proc_self_fd(fd: impl AsFd) -> String {
    format!("/proc/self/fd/{}", fd.as_fd().as_raw_fd())
}

/// This function reads the exact amount of bytes required to fill the buffer, possibly performing
/// multiple reads to do so (and also retrying if required to deal with EINTR).
///
/// The "-ish" is that, unlike the standard Read::read_exact() method, it's possible to determine
/// the difference between an incomplete read (where some amount of bytes were read, but the buffer
/// wasn't filled) and a "clean" EOF where an EOF occurred immediately with no data read at all.
///
/// # Return value
///
///  - `Ok(n)` with `n == buf.len()`: the buffer was filled
///  - `Ok(n)` with `n < buf.len()`: EOF was reached after `n` bytes (possibly zero)
///  - `Err(..)`: an underlying error from the `Read` implementation
pub fn read_exactish(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let buflen = buf.len();
    let mut todo: &mut [u8] = buf;

    while !todo.is_empty() {
        match reader.read(todo) {
            Ok(0) => return Ok(buflen - todo.len()),
            Ok(n) => todo = &mut todo[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(buflen)
}

/// Reads a decimal integer from a sysfs attribute file.
pub(crate) fn read_sysfs_u32(path: &str) -> Result<u32> {
    let text = std::fs::read_to_string(path)?;
    text.trim()
        .parse()
        .map_err(|e| Error::new(ErrorKind::InvalidData, e))
}
