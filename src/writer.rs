//! The image assembly pipeline.
//!
//! [`mkfs`] drives the whole build: the leaf emitter walks the source tree
//! and pushes inode/dentry/data/xattr nodes through the write head while
//! collecting the index leaf list; the index builder turns that list into
//! the on-flash B+-tree; the finalizer stitches in the GC reserve, the LPT,
//! the master nodes, the superblock, the log and the orphan area, in
//! dependency order.

use std::collections::{HashMap, HashSet};
use std::ffi::{CStr, OsStr};
use std::fs::File;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use rand::Rng;
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::fs::{fstat, makedev, openat, readlinkat, statat, AtFlags, Dir, FileType, Mode, OFlags, CWD};
use rustix::io::Errno;
use zerocopy::{FromZeros, IntoBytes};

use crate::auth::Authenticator;
use crate::compress::{Compressor, Selection, UBIFS_COMPR_NONE};
use crate::crypt::{Cryptor, InodeCrypt, UBIFS_XATTR_NAME_ENCRYPTION_CONTEXT};
use crate::devtable::{DeviceTable, DevtableEntry, DevtableKind};
use crate::error::{Error, Result};
use crate::format::*;
use crate::geometry::{Geometry, JHEAD_CNT};
use crate::key::Key;
use crate::lprops::{Ledger, LPROPS_INDEX};
use crate::lpt::{self, LptResult};
use crate::target::Target;
use crate::util::{align_up, align_up32, proc_self_fd, read_exactish};

/// The xattr this tool itself emits; never replicated from the host.
const INUM_ATTR_NAME: &[u8] = b"user.image-inode-number";

/// Normalized host inode attributes, squashed and overridden as configured.
#[derive(Clone, Copy, Debug, Default)]
struct HostStat {
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    size: u64,
    atime: i64,
    ctime: i64,
    mtime: i64,
    rdev: u64,
    dev: u64,
    ino: u64,
}

impl From<&rustix::fs::Stat> for HostStat {
    fn from(st: &rustix::fs::Stat) -> HostStat {
        HostStat {
            mode: st.st_mode as u32,
            uid: st.st_uid as u32,
            gid: st.st_gid as u32,
            nlink: st.st_nlink as u32,
            size: st.st_size as u64,
            atime: st.st_atime as i64,
            ctime: st.st_ctime as i64,
            mtime: st.st_mtime as i64,
            rdev: st.st_rdev as u64,
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
        }
    }
}

impl HostStat {
    fn file_type(&self) -> FileType {
        FileType::from_raw_mode(self.mode)
    }
}

/// One entry of the index leaf list.  The name is kept only to break ties
/// between colliding name hashes when the index is sorted.
struct IdxLeaf {
    key: Key,
    name: Box<[u8]>,
    lnum: u32,
    offs: u32,
    len: u32,
    hash: [u8; UBIFS_MAX_HASH_LEN],
}

/// Identity of a multi-linked host file, keyed by `(st_dev, st_ino)`.
struct InumMapping {
    use_inum: u64,
    use_nlink: u32,
    path: PathBuf,
    stat: HostStat,
}

fn xattr_recoverable(errno: Errno) -> bool {
    errno == Errno::OPNOTSUPP || errno == Errno::NOENT || errno == Errno::NODATA
}

fn host_type_matches(kind: DevtableKind, ft: FileType) -> bool {
    matches!(
        (kind, ft),
        (DevtableKind::Dir, FileType::Directory)
            | (DevtableKind::Char, FileType::CharacterDevice)
            | (DevtableKind::Block, FileType::BlockDevice)
            | (DevtableKind::Fifo, FileType::Fifo)
    )
}

/// Maps host inode attribute flags to their on-flash counterparts.
fn host_inode_flags(fd: impl AsFd, is_dir: bool) -> u32 {
    use rustix::fs::IFlags;
    let Ok(flags) = rustix::fs::ioctl_getflags(fd) else {
        return 0;
    };
    let mut out = 0;
    if flags.contains(IFlags::COMPRESSED) {
        out |= UBIFS_COMPR_FL;
    }
    if flags.contains(IFlags::SYNC) {
        out |= UBIFS_SYNC_FL;
    }
    if flags.contains(IFlags::IMMUTABLE) {
        out |= UBIFS_IMMUTABLE_FL;
    }
    if flags.contains(IFlags::APPEND) {
        out |= UBIFS_APPEND_FL;
    }
    if is_dir && flags.contains(IFlags::DIRSYNC) {
        out |= UBIFS_DIRSYNC_FL;
    }
    out
}

/// Builds a UBIFS image for `geo` into `target`, returning the final LEB
/// count.
pub fn mkfs(geo: &Geometry, target: &mut dyn Target) -> Result<u32> {
    let devtable = match &geo.devtable {
        Some(path) => DeviceTable::load(path)?,
        None => DeviceTable::empty(),
    };
    let compressor = Compressor::new(geo.compr, geo.favor_percent)?;
    let cryptor = match &geo.encryption {
        Some(enc) => Some(Cryptor::new(
            &enc.key_file,
            enc.key_descriptor.as_deref(),
            &enc.cipher,
            enc.padding,
        )?),
        None => None,
    };
    let auth = match &geo.auth {
        Some(auth) => Some(Authenticator::new(
            auth.hash_algo,
            &auth.key_file,
            &auth.cert_file,
        )?),
        None => None,
    };

    let mut builder = ImageBuilder {
        geo,
        target,
        compressor,
        cryptor,
        auth,
        devtable,
        leb_buf: vec![0; geo.leb_size as usize],
        head_lnum: geo.main_first,
        head_offs: 0,
        head_flags: 0,
        ledger: Ledger::new(
            geo.leb_size,
            geo.min_io_size,
            geo.dead_wm,
            geo.dark_wm,
            geo.main_first,
        ),
        idx: Vec::new(),
        inum_map: HashMap::new(),
        inum_order: Vec::new(),
        max_sqnum: 0,
        highest_inum: UBIFS_FIRST_INO,
        creat_sqnum: 0,
        root_st: HostStat::default(),
        zroot: (0, 0, 0),
        old_idx_sz: 0,
        ihead_lnum: 0,
        ihead_offs: 0,
        gc_lnum: 0,
        leb_cnt: 0,
        main_lebs: 0,
        lpt_result: LptResult::default(),
        root_idx_hash: [0; UBIFS_MAX_HASH_LEN],
        mst_hash: [0; UBIFS_MAX_HASH_LEN],
    };

    builder.write_data()?;
    builder.set_gc_lnum()?;
    builder.write_index()?;
    builder.finalize_leb_cnt()?;
    builder.write_lpt()?;
    builder.write_master()?;
    builder.write_super()?;
    builder.write_log()?;
    builder.write_orphan_area()?;

    let leb_cnt = builder.leb_cnt;
    builder.target.finish(leb_cnt)?;
    Ok(leb_cnt)
}

struct ImageBuilder<'a> {
    geo: &'a Geometry,
    target: &'a mut dyn Target,
    compressor: Compressor,
    cryptor: Option<Cryptor>,
    auth: Option<Authenticator>,
    devtable: DeviceTable,

    leb_buf: Vec<u8>,
    head_lnum: u32,
    head_offs: usize,
    head_flags: u8,
    ledger: Ledger,

    idx: Vec<IdxLeaf>,
    inum_map: HashMap<(u64, u64), InumMapping>,
    inum_order: Vec<(u64, u64)>,

    max_sqnum: u64,
    highest_inum: u64,
    creat_sqnum: u64,
    root_st: HostStat,

    zroot: (u32, u32, u32),
    old_idx_sz: u64,
    ihead_lnum: u32,
    ihead_offs: u32,
    gc_lnum: u32,
    leb_cnt: u32,
    main_lebs: u32,
    lpt_result: LptResult,
    root_idx_hash: [u8; UBIFS_MAX_HASH_LEN],
    mst_hash: [u8; UBIFS_MAX_HASH_LEN],
}

impl ImageBuilder<'_> {
    fn next_sqnum(&mut self) -> u64 {
        self.max_sqnum += 1;
        self.max_sqnum
    }

    fn hash_len(&self) -> usize {
        self.auth.as_ref().map_or(0, |a| a.hash_len())
    }

    /* The write head */

    fn write_empty_leb(&mut self, lnum: u32) -> Result<()> {
        self.leb_buf.fill(0xFF);
        self.target.leb_change(lnum, &self.leb_buf)
    }

    /// Writes out the current head LEB and moves the head to the next one.
    fn flush_nodes(&mut self) -> Result<()> {
        if self.head_offs == 0 {
            return Ok(());
        }
        let wlen = align_up(self.head_offs, self.geo.min_io_size as usize);
        pad(&mut self.leb_buf[self.head_offs..wlen]);
        self.leb_buf[wlen..].fill(0xFF);
        self.target.leb_change(self.head_lnum, &self.leb_buf)?;
        self.ledger
            .record(self.head_lnum, self.head_offs as u32, self.head_flags);
        self.head_lnum += 1;
        self.head_offs = 0;
        Ok(())
    }

    /// Reserves space for a node, flushing first when it does not fit.
    fn reserve_space(&mut self, len: usize) -> Result<(u32, usize)> {
        if len > self.geo.leb_size as usize - self.head_offs {
            self.flush_nodes()?;
        }
        let pos = (self.head_lnum, self.head_offs);
        self.head_offs += align_up(len, 8);
        Ok(pos)
    }

    /// Seals a leaf node, places it at the head and records it in the index
    /// leaf list.
    fn add_node(&mut self, key: Key, name: Box<[u8]>, node: &mut [u8]) -> Result<()> {
        let sqnum = self.next_sqnum();
        prepare_node(node, sqnum);

        let (lnum, offs) = self.reserve_space(node.len())?;
        let end = offs + node.len();
        self.leb_buf[offs..end].copy_from_slice(node);
        self.leb_buf[end..offs + align_up(node.len(), 8)].fill(0xFF);

        let mut hash = [0u8; UBIFS_MAX_HASH_LEN];
        if let Some(auth) = &self.auth {
            auth.node_hash(node, &mut hash)?;
        }

        self.idx.push(IdxLeaf {
            key,
            name,
            lnum,
            offs: offs as u32,
            len: node.len() as u32,
            hash,
        });
        Ok(())
    }

    /* The leaf emitter */

    /// Reads the extended attributes of a host inode through its fd.  An
    /// unsupported filesystem simply yields none.
    fn read_xattrs(&self, fd: impl AsFd, host_path: &Path) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        // flistxattr() doesn't work with O_PATH fds, so go via /proc/self/fd.
        // The symlink-following variant produces the correct behaviour even
        // when reading the xattrs of a symlink itself.
        let filename = proc_self_fd(&fd);

        let mut names_buf = vec![MaybeUninit::new(0u8); 65536];
        let names = match rustix::fs::listxattr(&filename, &mut *names_buf) {
            Ok((names, _)) => names,
            Err(errno) if xattr_recoverable(errno) => {
                debug!(
                    "{}",
                    Error::HostAttrUnavailable {
                        path: host_path.to_owned(),
                        source: errno.into(),
                    }
                );
                return Ok(Vec::new());
            }
            Err(errno) => return Err(Error::source_io(host_path, errno)),
        };

        let mut out = Vec::new();
        for name in names.split_inclusive(|&c| c == 0) {
            let Ok(name) = CStr::from_bytes_with_nul(name) else {
                continue;
            };
            if name.to_bytes().is_empty() || name.to_bytes() == INUM_ATTR_NAME {
                continue;
            }
            let mut value_buf = vec![MaybeUninit::uninit(); 65536];
            let value = match rustix::fs::getxattr(&filename, name, &mut *value_buf) {
                Ok((value, _)) => value,
                Err(errno) if xattr_recoverable(errno) => {
                    debug!(
                        "skipping xattr '{}' on '{}': {errno}",
                        name.to_string_lossy(),
                        host_path.display()
                    );
                    continue;
                }
                Err(errno) => return Err(Error::source_io(host_path, errno)),
            };
            if value.len() > UBIFS_MAX_INO_DATA {
                warn!(
                    "skipping oversized xattr '{}' on '{}'",
                    name.to_string_lossy(),
                    host_path.display()
                );
                continue;
            }
            out.push((name.to_bytes().to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    /// Emits an xattr entry plus its value-carrying inode, and accounts for
    /// them in the host inode.
    fn add_xattr(
        &mut self,
        host_ino: &mut InoNode,
        st: &HostStat,
        host_inum: u64,
        name: &[u8],
        value: &[u8],
    ) -> Result<()> {
        host_ino.xattr_cnt = (host_ino.xattr_cnt.get() + 1).into();
        let growth = calc_dent_size(name.len()) + calc_xattr_bytes(value.len());
        host_ino.xattr_size = (host_ino.xattr_size.get() + growth as u32).into();
        host_ino.xattr_names = (host_ino.xattr_names.get() + name.len() as u32).into();

        let xkey = Key::xent(host_inum, self.geo.key_hash, name);
        let mut xent = DentNode::new_zeroed();
        xent.ch.node_type = UBIFS_XENT_NODE;
        xent.key = xkey.to_node_bytes();
        xent.dtype = UBIFS_ITYPE_REG;
        xent.nlen = (name.len() as u16).into();

        self.highest_inum += 1;
        let inum = self.highest_inum;
        self.creat_sqnum = self.next_sqnum();
        xent.inum = inum.into();

        let mut node = Vec::with_capacity(UBIFS_XENT_NODE_SZ + name.len() + 1);
        node.extend_from_slice(xent.as_bytes());
        node.extend_from_slice(name);
        node.push(0);
        self.add_node(xkey, Box::from(name), &mut node)?;

        let nkey = Key::ino(inum);
        let mut ino = InoNode::new_zeroed();
        ino.ch.node_type = UBIFS_INO_NODE;
        ino.key = nkey.to_node_bytes();
        ino.creat_sqnum = self.creat_sqnum.into();
        ino.nlink = 1.into();
        ino.atime_sec = (st.atime as u64).into();
        ino.ctime_sec = (st.ctime as u64).into();
        ino.mtime_sec = (st.mtime as u64).into();
        ino.uid = st.uid.into();
        ino.gid = st.gid.into();
        ino.compr_type = self.compressor.on_flash_default().into();
        ino.size = (value.len() as u64).into();
        ino.mode = 0o100000.into();
        ino.data_len = (value.len() as u32).into();
        ino.flags = UBIFS_XATTR_FL.into();

        let mut node = Vec::with_capacity(UBIFS_INO_NODE_SZ + value.len());
        node.extend_from_slice(ino.as_bytes());
        node.extend_from_slice(value);
        self.add_node(nkey, Box::default(), &mut node)
    }

    /// Emits an inode node with its inline data, preceded by its xattr
    /// entries.
    fn add_inode(
        &mut self,
        st: &HostStat,
        inum: u64,
        data: &[u8],
        host_fl: u32,
        xattrs: &[(Vec<u8>, Vec<u8>)],
        crypt: Option<&InodeCrypt>,
    ) -> Result<()> {
        let mut use_flags = 0;
        if self.compressor.on_flash_default() != UBIFS_COMPR_NONE {
            use_flags |= UBIFS_COMPR_FL;
        }
        use_flags |= host_fl & (UBIFS_COMPR_FL | UBIFS_SYNC_FL | UBIFS_IMMUTABLE_FL | UBIFS_APPEND_FL);
        if host_fl & UBIFS_DIRSYNC_FL != 0 && st.file_type() == FileType::Directory {
            use_flags |= UBIFS_DIRSYNC_FL;
        }
        if crypt.is_some() {
            use_flags |= UBIFS_CRYPT_FL;
        }

        let inline: Vec<u8> = if data.is_empty() {
            Vec::new()
        } else if let Some(crypt) = crypt {
            if st.file_type() != FileType::Symlink {
                return Err(Error::EncryptionFailed(
                    "inline data on an encrypted non-symlink inode".to_string(),
                ));
            }
            crypt.encrypt_symlink(data)?
        } else {
            data.to_vec()
        };

        let key = Key::ino(inum);
        let mut ino = InoNode::new_zeroed();
        ino.ch.node_type = UBIFS_INO_NODE;
        ino.key = key.to_node_bytes();
        ino.creat_sqnum = self.creat_sqnum.into();
        ino.size = st.size.into();
        ino.nlink = st.nlink.into();
        ino.atime_sec = (st.atime as u64).into();
        ino.ctime_sec = (st.ctime as u64).into();
        ino.mtime_sec = (st.mtime as u64).into();
        ino.uid = st.uid.into();
        ino.gid = st.gid.into();
        ino.mode = st.mode.into();
        ino.flags = use_flags.into();
        ino.compr_type = self.compressor.on_flash_default().into();
        ino.data_len = (inline.len() as u32).into();

        for (name, value) in xattrs {
            self.add_xattr(&mut ino, st, inum, name, value)?;
        }
        if self.geo.set_inum_attr {
            let value = inum.to_string();
            self.add_xattr(&mut ino, st, inum, INUM_ATTR_NAME, value.as_bytes())?;
        }
        if let Some(crypt) = crypt {
            let context = crypt.context_bytes().to_vec();
            self.add_xattr(
                &mut ino,
                st,
                inum,
                UBIFS_XATTR_NAME_ENCRYPTION_CONTEXT.as_bytes(),
                &context,
            )?;
        }

        let mut node = Vec::with_capacity(UBIFS_INO_NODE_SZ + inline.len());
        node.extend_from_slice(ino.as_bytes());
        node.extend_from_slice(&inline);
        self.add_node(key, Box::default(), &mut node)
    }

    /// Emits a directory entry into `dir_inum`, returning the length of the
    /// name as stored on flash (encrypted names grow).
    fn add_dent_node(
        &mut self,
        dir_inum: u64,
        name: &OsStr,
        inum: u64,
        dtype: u8,
        crypt: Option<&InodeCrypt>,
    ) -> Result<usize> {
        debug!("dent '{}' ino {inum} type {dtype} dir ino {dir_inum}", name.to_string_lossy());
        let kname: Vec<u8> = match crypt {
            None => name.as_bytes().to_vec(),
            Some(crypt) => {
                let max_namelen = if dtype == UBIFS_ITYPE_LNK {
                    UBIFS_MAX_INO_DATA
                } else {
                    UBIFS_MAX_NLEN
                };
                crypt.encrypt_name(name.as_bytes(), max_namelen)?
            }
        };

        let key = Key::dent(dir_inum, self.geo.key_hash, &kname);
        let mut dent = DentNode::new_zeroed();
        dent.ch.node_type = UBIFS_DENT_NODE;
        dent.key = key.to_node_bytes();
        dent.inum = inum.into();
        dent.dtype = dtype;
        dent.nlen = (kname.len() as u16).into();
        if self.geo.double_hash {
            dent.cookie = rand::rng().random::<u32>().into();
        }

        let kname_len = kname.len();
        let mut node = Vec::with_capacity(UBIFS_DENT_NODE_SZ + kname_len + 1);
        node.extend_from_slice(dent.as_bytes());
        node.extend_from_slice(&kname);
        node.push(0);
        self.add_node(key, kname.into_boxed_slice(), &mut node)?;
        Ok(kname_len)
    }

    /// Streams a regular file block by block, then emits its inode.
    fn add_file(
        &mut self,
        fd: OwnedFd,
        host_path: &Path,
        st: &HostStat,
        inum: u64,
        host_fl: u32,
        xattrs: &[(Vec<u8>, Vec<u8>)],
        crypt: Option<&InodeCrypt>,
    ) -> Result<()> {
        let mut file = File::from(fd);
        let mut buf = vec![0u8; UBIFS_BLOCK_SIZE];
        let mut block_no: u32 = 0;
        let mut file_size: u64 = 0;

        loop {
            let n = read_exactish(&mut file, &mut buf)
                .map_err(|e| Error::source_io(host_path, e))?;
            if n == 0 {
                break;
            }
            file_size += n as u64;
            let block = &buf[..n];

            // Skip holes.
            if block.iter().all(|&b| b == 0) {
                block_no += 1;
                if n < UBIFS_BLOCK_SIZE {
                    break;
                }
                continue;
            }

            let selection = if self.geo.compr == Selection::None
                && !self.geo.encrypted
                && host_fl & UBIFS_COMPR_FL != 0
            {
                Compressor::forced_selection()
            } else {
                self.compressor.selection()
            };
            let (compr_type, mut payload) = self.compressor.compress_as(selection, block)?;

            let key = Key::data(inum, block_no);
            let mut dn = DataNode::new_zeroed();
            dn.ch.node_type = UBIFS_DATA_NODE;
            dn.key = key.to_node_bytes();
            dn.size = (n as u32).into();
            dn.compr_type = compr_type.into();
            if let Some(crypt) = crypt {
                dn.compr_size = (payload.len() as u16).into();
                payload = crypt.encrypt_data(block_no, &payload)?;
            }

            let mut node = Vec::with_capacity(UBIFS_DATA_NODE_SZ + payload.len());
            node.extend_from_slice(dn.as_bytes());
            node.extend_from_slice(&payload);
            self.add_node(key, Box::default(), &mut node)?;

            block_no += 1;
            if n < UBIFS_BLOCK_SIZE {
                break;
            }
        }

        if file_size != st.size {
            return Err(Error::source_io(
                host_path,
                std::io::Error::other("file size changed while reading"),
            ));
        }

        self.add_inode(st, inum, &[], host_fl, xattrs, crypt)
    }

    /// Emits an inode for a character or block device; the device number is
    /// the inline data.
    fn add_dev_inode(
        &mut self,
        st: &HostStat,
        inum: u64,
        host_fl: u32,
        xattrs: &[(Vec<u8>, Vec<u8>)],
    ) -> Result<()> {
        let dev = st.rdev.to_le_bytes();
        let mut st = *st;
        st.size = dev.len() as u64;
        self.add_inode(&st, inum, &dev, host_fl, xattrs, None)
    }

    fn add_symlink_inode(
        &mut self,
        dirfd: BorrowedFd,
        name: &OsStr,
        host_path: &Path,
        st: &HostStat,
        inum: u64,
        xattrs: &[(Vec<u8>, Vec<u8>)],
        crypt: Option<&InodeCrypt>,
    ) -> Result<()> {
        let target = readlinkat(dirfd, name, Vec::new())
            .map_err(|e| Error::source_io(host_path, e))?;
        let target = target.as_bytes();
        if target.len() > UBIFS_MAX_INO_DATA {
            return Err(Error::SymlinkTooLong {
                path: host_path.to_owned(),
            });
        }
        let mut st = *st;
        st.size = target.len() as u64;
        self.add_inode(&st, inum, target, 0, xattrs, crypt)
    }

    /// Emits everything for a non-directory entry and returns its dentry
    /// type.  Multi-linked files are only parked in the identity table; they
    /// are emitted later with their final link counts.
    #[allow(clippy::too_many_arguments)]
    fn add_non_dir(
        &mut self,
        dirfd: BorrowedFd,
        name: &OsStr,
        host_path: &Path,
        inum: &mut u64,
        nlink: u32,
        st: &mut HostStat,
        crypt: Option<&InodeCrypt>,
    ) -> Result<u8> {
        debug!("{}", host_path.display());
        let dtype = match st.file_type() {
            FileType::RegularFile => UBIFS_ITYPE_REG,
            FileType::CharacterDevice => UBIFS_ITYPE_CHR,
            FileType::BlockDevice => UBIFS_ITYPE_BLK,
            FileType::Symlink => UBIFS_ITYPE_LNK,
            FileType::Socket => UBIFS_ITYPE_SOCK,
            FileType::Fifo => UBIFS_ITYPE_FIFO,
            _ => {
                return Err(Error::source_io(
                    host_path,
                    std::io::Error::other("unknown inode type"),
                ))
            }
        };

        if nlink != 0 {
            st.nlink = nlink;
        } else if st.nlink > 1 {
            // Count links within the tree first; the inode is emitted by the
            // multi-link pass once the final count is known.
            let identity = (st.dev, st.ino);
            match self.inum_map.entry(identity) {
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(InumMapping {
                        use_inum: *inum,
                        use_nlink: 1,
                        path: host_path.to_owned(),
                        stat: *st,
                    });
                    self.inum_order.push(identity);
                }
                std::collections::hash_map::Entry::Occupied(mut slot) => {
                    let mapping = slot.get_mut();
                    *inum = mapping.use_inum;
                    mapping.use_nlink += 1;
                    mapping.stat = *st;
                    // Return the unused inode number.
                    self.highest_inum -= 1;
                }
            }
            return Ok(dtype);
        } else {
            st.nlink = 1;
        }

        self.creat_sqnum = self.next_sqnum();

        match st.file_type() {
            FileType::RegularFile => {
                let fd = openat(
                    dirfd,
                    name,
                    OFlags::RDONLY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
                    Mode::empty(),
                )
                .map_err(|e| Error::source_io(host_path, e))?;
                let host_fl = host_inode_flags(&fd, false);
                let xattrs = self.read_xattrs(&fd, host_path)?;
                self.add_file(fd, host_path, st, *inum, host_fl, &xattrs, crypt)?;
            }
            FileType::CharacterDevice | FileType::BlockDevice => {
                let fd = openat(
                    dirfd,
                    name,
                    OFlags::PATH | OFlags::NOFOLLOW | OFlags::CLOEXEC,
                    Mode::empty(),
                )
                .map_err(|e| Error::source_io(host_path, e))?;
                let xattrs = self.read_xattrs(&fd, host_path)?;
                self.add_dev_inode(st, *inum, 0, &xattrs)?;
            }
            FileType::Symlink => {
                let fd = openat(
                    dirfd,
                    name,
                    OFlags::PATH | OFlags::NOFOLLOW | OFlags::CLOEXEC,
                    Mode::empty(),
                )
                .map_err(|e| Error::source_io(host_path, e))?;
                let xattrs = self.read_xattrs(&fd, host_path)?;
                self.add_symlink_inode(dirfd, name, host_path, st, *inum, &xattrs, crypt)?;
            }
            FileType::Socket | FileType::Fifo => {
                self.add_inode(st, *inum, &[], 0, &[], None)?;
            }
            _ => unreachable!(),
        }

        Ok(dtype)
    }

    /// Emits a synthetic non-directory entry defined by the device table.
    fn add_devtable_leaf(&mut self, entry: &DevtableEntry, inum: u64, st: &HostStat) -> Result<u8> {
        self.creat_sqnum = self.next_sqnum();
        match entry.kind {
            DevtableKind::Char => {
                self.add_dev_inode(st, inum, 0, &[])?;
                Ok(UBIFS_ITYPE_CHR)
            }
            DevtableKind::Block => {
                self.add_dev_inode(st, inum, 0, &[])?;
                Ok(UBIFS_ITYPE_BLK)
            }
            DevtableKind::Fifo => {
                self.add_inode(st, inum, &[], 0, &[], None)?;
                Ok(UBIFS_ITYPE_FIFO)
            }
            DevtableKind::Dir => unreachable!(),
        }
    }

    fn apply_devtable_override(
        &self,
        entry: &DevtableEntry,
        st: &mut HostStat,
        host_path: &Path,
    ) -> Result<()> {
        if !host_type_matches(entry.kind, st.file_type()) {
            return Err(Error::DeviceTableInvalid(format!(
                "entry type does not match '{}'",
                host_path.display()
            )));
        }
        st.mode = entry.full_mode();
        st.uid = entry.uid;
        st.gid = entry.gid;
        if matches!(entry.kind, DevtableKind::Char | DevtableKind::Block) {
            st.rdev = makedev(entry.major, entry.minor);
        }
        Ok(())
    }

    /// The device-table key for an entry named `name` inside `image_path`.
    fn child_image_path(image_path: &str, name: &str) -> String {
        if image_path == "/" {
            format!("/{name}")
        } else {
            format!("{image_path}/{name}")
        }
    }

    /// Walks one directory: host entries first, then entries the device
    /// table adds, then the directory's own inode.  `host` is `None` for
    /// directories that exist only in the device table.
    fn add_directory(
        &mut self,
        host: Option<(OwnedFd, PathBuf)>,
        image_path: String,
        dir_inum: u64,
        dir_st: HostStat,
        crypt: Option<InodeCrypt>,
    ) -> Result<()> {
        let dir_creat_sqnum = self.next_sqnum();

        let mut size = UBIFS_INO_NODE_SZ as u64;
        let mut nlink: u32 = 2;
        let mut seen: HashSet<String> = HashSet::new();

        if let Some((fd, host_path)) = &host {
            debug!("{}", host_path.display());
            for item in Dir::read_from(fd).map_err(|e| Error::source_io(host_path, e))? {
                let entry = item.map_err(|e| Error::source_io(host_path, e))?;
                let name = OsStr::from_bytes(entry.file_name().to_bytes()).to_owned();
                if name == "." || name == ".." {
                    continue;
                }
                let child_path = host_path.join(&name);

                let raw = statat(fd, name.as_os_str(), AtFlags::SYMLINK_NOFOLLOW)
                    .map_err(|e| Error::source_io(&child_path, e))?;
                let mut st = HostStat::from(&raw);

                if self.geo.squash_owner {
                    // The device table may still override this below.
                    st.uid = 0;
                    st.gid = 0;
                }
                if let Some(entry) = self
                    .devtable
                    .lookup(&image_path, &name.to_string_lossy())
                    .cloned()
                {
                    self.apply_devtable_override(&entry, &mut st, &child_path)?;
                    seen.insert(entry.name.clone());
                }

                self.highest_inum += 1;
                let mut inum = self.highest_inum;

                let child_crypt = match (&self.cryptor, &crypt) {
                    (Some(cryptor), Some(parent)) => Some(cryptor.inherit(parent)?),
                    _ => None,
                };

                let dtype = if st.file_type() == FileType::Directory {
                    let child_fd = openat(
                        fd,
                        name.as_os_str(),
                        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
                        Mode::empty(),
                    )
                    .map_err(|e| Error::source_io(&child_path, e))?;
                    let child_image = Self::child_image_path(&image_path, &name.to_string_lossy());
                    self.add_directory(
                        Some((child_fd, child_path.clone())),
                        child_image,
                        inum,
                        st,
                        child_crypt,
                    )?;
                    nlink += 1;
                    UBIFS_ITYPE_DIR
                } else {
                    self.add_non_dir(
                        fd.as_fd(),
                        &name,
                        &child_path,
                        &mut inum,
                        0,
                        &mut st,
                        child_crypt.as_ref(),
                    )?
                };

                let kname_len = self.add_dent_node(dir_inum, &name, inum, dtype, crypt.as_ref())?;
                size += calc_dent_size(kname_len) as u64;
            }
        }

        // Entries the device table defines that the host tree did not have.
        let synthetic: Vec<DevtableEntry> = self
            .devtable
            .entries(&image_path)
            .iter()
            .filter(|e| !e.name.is_empty() && !seen.contains(&e.name))
            .cloned()
            .collect();
        for entry in synthetic {
            let mut st = self.root_st;
            st.mode = entry.full_mode();
            st.uid = entry.uid;
            st.gid = entry.gid;
            st.rdev = makedev(entry.major, entry.minor);
            st.nlink = 1;
            st.size = 0;

            self.highest_inum += 1;
            let inum = self.highest_inum;

            let child_crypt = match (&self.cryptor, &crypt) {
                (Some(cryptor), Some(parent)) => Some(cryptor.inherit(parent)?),
                _ => None,
            };

            let dtype = if entry.kind == DevtableKind::Dir {
                st.nlink = 2;
                let child_image = Self::child_image_path(&image_path, &entry.name);
                self.add_directory(None, child_image, inum, st, child_crypt)?;
                nlink += 1;
                UBIFS_ITYPE_DIR
            } else {
                self.add_devtable_leaf(&entry, inum, &st)?
            };

            let name = entry.name.clone();
            let kname_len =
                self.add_dent_node(dir_inum, OsStr::new(&name), inum, dtype, crypt.as_ref())?;
            size += calc_dent_size(kname_len) as u64;
        }

        // The directory's own inode carries a creation sequence number from
        // before its children.
        self.creat_sqnum = dir_creat_sqnum;

        let (host_fl, xattrs) = match &host {
            Some((fd, host_path)) => (
                host_inode_flags(fd, true),
                self.read_xattrs(fd, host_path)?,
            ),
            None => (0, Vec::new()),
        };
        let mut st = dir_st;
        st.size = size;
        st.nlink = nlink;
        self.add_inode(&st, dir_inum, &[], host_fl, &xattrs, crypt.as_ref())
    }

    /// Emits the inodes of multi-linked files parked in the identity table,
    /// now that their in-tree link counts are final.
    fn add_multi_linked_files(&mut self) -> Result<()> {
        for identity in std::mem::take(&mut self.inum_order) {
            let mapping = self.inum_map.remove(&identity).expect("mapping vanished");
            debug!("{}", mapping.path.display());
            let mut st = mapping.stat;
            let mut inum = mapping.use_inum;
            self.add_non_dir(
                CWD,
                mapping.path.as_os_str(),
                &mapping.path,
                &mut inum,
                mapping.use_nlink,
                &mut st,
                None,
            )?;
        }
        Ok(())
    }

    /// Walks the source tree and emits all leaves.
    fn write_data(&mut self) -> Result<()> {
        let root_crypt = match &self.cryptor {
            Some(cryptor) => Some(cryptor.root_context()?),
            None => None,
        };

        let (host, mut root_st) = match &self.geo.root {
            Some(path) => {
                let fd = openat(
                    CWD,
                    path,
                    OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
                    Mode::empty(),
                )
                .map_err(|e| Error::source_io(path, e))?;
                let raw = fstat(&fd).map_err(|e| Error::source_io(path, e))?;
                (Some((fd, path.clone())), HostStat::from(&raw))
            }
            None => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                let st = HostStat {
                    mode: 0o040755,
                    nlink: 2,
                    atime: now,
                    ctime: now,
                    mtime: now,
                    ..HostStat::default()
                };
                (None, st)
            }
        };

        if self.geo.squash_owner {
            root_st.uid = 0;
            root_st.gid = 0;
        }
        if let Some(entry) = self.devtable.root_override().cloned() {
            if entry.kind != DevtableKind::Dir {
                return Err(Error::DeviceTableInvalid(
                    "the root entry must be a directory".to_string(),
                ));
            }
            root_st.mode = entry.full_mode();
            root_st.uid = entry.uid;
            root_st.gid = entry.gid;
        }
        self.root_st = root_st;

        self.head_flags = 0;
        self.add_directory(host, "/".to_string(), UBIFS_ROOT_INO, root_st, root_crypt)?;
        self.add_multi_linked_files()?;
        self.flush_nodes()
    }

    /* The index builder */

    /// Seals an index node and places it at the head.  The last node written
    /// becomes the index root.
    fn add_idx_node(&mut self, node: &mut [u8]) -> Result<()> {
        let sqnum = self.next_sqnum();
        prepare_node(node, sqnum);

        let (lnum, offs) = self.reserve_space(node.len())?;
        let end = offs + node.len();
        self.leb_buf[offs..end].copy_from_slice(node);
        self.leb_buf[end..offs + align_up(node.len(), 8)].fill(0xFF);

        self.old_idx_sz += align_up(node.len(), 8) as u64;
        self.zroot = (lnum, offs as u32, node.len() as u32);
        Ok(())
    }

    /// Sorts the index leaf list and builds the on-flash index bottom-up.
    fn write_index(&mut self) -> Result<()> {
        let fanout = self.geo.fanout as usize;
        let hash_len = self.hash_len();
        let leb_size = self.geo.leb_size as usize;
        let idx_sz = idx_node_sz(fanout, hash_len);

        debug!("leaf node count: {}", self.idx.len());
        self.head_flags = LPROPS_INDEX;

        let mut leaves = std::mem::take(&mut self.idx);
        let idx_cnt = leaves.len();
        idx_cnt
            .checked_mul(std::mem::size_of::<IdxLeaf>())
            .ok_or(Error::IndexTooBig(idx_cnt))?;

        leaves.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.name.cmp(&b.name)));
        debug_assert!(
            leaves
                .windows(2)
                .all(|w| w[0].key != w[1].key || w[0].name != w[1].name),
            "duplicate keys with identical names"
        );

        // The shadow position of the row below, replayed when filling
        // branches on the rows above.
        let (mut blnum, mut boffs) = (self.head_lnum, self.head_offs);

        let mut cnt = idx_cnt.div_ceil(fanout);
        let mut hashes = vec![0u8; hash_len * cnt.max(1)];
        let mut child_cnt = 0;

        // Level 0: pack consecutive leaves, fanout at a time.
        let mut p = 0;
        for i in 0..cnt {
            child_cnt = if i == cnt - 1 {
                let rest = idx_cnt % fanout;
                if rest == 0 {
                    fanout
                } else {
                    rest
                }
            } else {
                fanout
            };

            let mut header = IdxNode::new_zeroed();
            header.ch.node_type = UBIFS_IDX_NODE;
            header.child_cnt = (child_cnt as u16).into();
            header.level = 0.into();

            let mut node = Vec::with_capacity(idx_node_sz(child_cnt, hash_len));
            node.extend_from_slice(header.as_bytes());
            for leaf in &leaves[p..p + child_cnt] {
                let mut branch = Branch::new_zeroed();
                branch.lnum = leaf.lnum.into();
                branch.offs = leaf.offs.into();
                branch.len = leaf.len.into();
                node.extend_from_slice(branch.as_bytes());
                node.extend_from_slice(&leaf.key.to_idx_bytes());
                node.extend_from_slice(&leaf.hash[..hash_len]);
            }
            p += child_cnt;

            self.add_idx_node(&mut node)?;
            if let Some(auth) = &self.auth {
                auth.node_hash(&node, &mut hashes[i * hash_len..(i + 1) * hash_len])?;
            }
        }

        // Higher levels: the key of a branch is the key of its first
        // descendant leaf, found by stepping the leaf array in powers of the
        // fanout.
        let mut level: u16 = 0;
        let mut pstep = 1;
        while cnt > 1 {
            let blast_len = idx_node_sz(child_cnt, hash_len);
            let bcnt = cnt;
            cnt = cnt.div_ceil(fanout).max(1);
            level += 1;
            let mut p = 0;
            pstep *= fanout;

            for i in 0..cnt {
                child_cnt = if i == cnt - 1 {
                    let rest = bcnt % fanout;
                    if rest == 0 {
                        fanout
                    } else {
                        rest
                    }
                } else {
                    fanout
                };

                let mut header = IdxNode::new_zeroed();
                header.ch.node_type = UBIFS_IDX_NODE;
                header.child_cnt = (child_cnt as u16).into();
                header.level = level.into();

                let mut node = Vec::with_capacity(idx_node_sz(child_cnt, hash_len));
                node.extend_from_slice(header.as_bytes());
                for j in 0..child_cnt {
                    let bn = i * fanout + j;
                    // All nodes on the row below are full except the last.
                    let blen = if bn == bcnt - 1 { blast_len } else { idx_sz };
                    if boffs + blen > leb_size {
                        blnum += 1;
                        boffs = 0;
                    }
                    let mut branch = Branch::new_zeroed();
                    branch.lnum = blnum.into();
                    branch.offs = (boffs as u32).into();
                    branch.len = (blen as u32).into();
                    node.extend_from_slice(branch.as_bytes());
                    node.extend_from_slice(&leaves[p].key.to_idx_bytes());
                    node.extend_from_slice(&hashes[bn * hash_len..(bn + 1) * hash_len]);
                    boffs += align_up(blen, 8);
                    p += pstep;
                }

                self.add_idx_node(&mut node)?;
                if let Some(auth) = &self.auth {
                    let mut hash = [0u8; UBIFS_MAX_HASH_LEN];
                    auth.node_hash(&node, &mut hash)?;
                    hashes[i * hash_len..(i + 1) * hash_len].copy_from_slice(&hash[..hash_len]);
                }
            }
        }

        if hash_len > 0 {
            self.root_idx_hash[..hash_len].copy_from_slice(&hashes[..hash_len]);
        }
        drop(leaves);

        debug!(
            "zroot is at {}:{} len {}, index size {}",
            self.zroot.0, self.zroot.1, self.zroot.2, self.old_idx_sz
        );

        self.ihead_lnum = self.head_lnum;
        self.ihead_offs = align_up32(self.head_offs as u32, self.geo.min_io_size);
        self.flush_nodes()?;
        self.head_flags = 0;
        Ok(())
    }

    /* The finalizer */

    /// Reserves the empty LEB the runtime garbage collector requires.
    fn set_gc_lnum(&mut self) -> Result<()> {
        self.gc_lnum = self.head_lnum;
        self.head_lnum += 1;
        self.write_empty_leb(self.gc_lnum)?;
        self.ledger.record(self.gc_lnum, 0, 0);
        self.ledger.note_empty_leb();
        Ok(())
    }

    fn finalize_leb_cnt(&mut self) -> Result<()> {
        self.leb_cnt = self.head_lnum;
        if self.leb_cnt > self.geo.max_leb_cnt {
            return Err(Error::TooManyLebs {
                need: self.leb_cnt,
                max: self.geo.max_leb_cnt,
            });
        }
        self.main_lebs = self.leb_cnt - self.geo.main_first;
        info!(
            "leb_cnt {} main_lebs {} idx_lebs {} empty_lebs {}",
            self.leb_cnt, self.main_lebs, self.ledger.lst.idx_lebs, self.ledger.lst.empty_lebs
        );
        Ok(())
    }

    fn write_lpt(&mut self) -> Result<()> {
        self.ledger.resize_to_main_lebs(self.main_lebs as usize);

        let Self {
            target,
            leb_buf,
            ledger,
            auth,
            geo,
            main_lebs,
            ..
        } = self;
        let lpt_first = UBIFS_LOG_LNUM + geo.log_lebs;

        let mut write_leb = |lnum: u32, used: &[u8]| -> Result<()> {
            leb_buf[..used.len()].copy_from_slice(used);
            leb_buf[used.len()..].fill(0xFF);
            target.leb_change(lnum, leb_buf)
        };

        self.lpt_result = lpt::write_lpt(
            &geo.lpt,
            geo.leb_size,
            geo.min_io_size,
            lpt_first,
            geo.main_first,
            *main_lebs as usize,
            &ledger.props,
            auth.as_ref(),
            &mut write_leb,
        )?;
        Ok(())
    }

    /// Lays a prepared node at the start of a LEB and writes the LEB out.
    fn write_prepared_node_leb(&mut self, node: &[u8], lnum: u32) -> Result<()> {
        let alen = align_up(node.len(), 8);
        let wlen = align_up(node.len(), self.geo.min_io_size as usize);
        self.leb_buf[..node.len()].copy_from_slice(node);
        self.leb_buf[node.len()..alen].fill(0xFF);
        pad(&mut self.leb_buf[alen..wlen]);
        self.leb_buf[wlen..].fill(0xFF);
        self.target.leb_change(lnum, &self.leb_buf)
    }

    fn write_node_leb(&mut self, node: &mut [u8], lnum: u32) -> Result<()> {
        let sqnum = self.next_sqnum();
        prepare_node(node, sqnum);
        self.write_prepared_node_leb(node, lnum)
    }

    /// Writes the master node, byte-identical in two consecutive LEBs.
    fn write_master(&mut self) -> Result<()> {
        let lst = &self.ledger.lst;
        let mut mst = MstNode::new_zeroed();
        mst.ch.node_type = UBIFS_MST_NODE;
        mst.log_lnum = UBIFS_LOG_LNUM.into();
        mst.highest_inum = self.highest_inum.into();
        mst.cmt_no = 0.into();
        mst.flags = UBIFS_MST_NO_ORPHS.into();
        mst.root_lnum = self.zroot.0.into();
        mst.root_offs = self.zroot.1.into();
        mst.root_len = self.zroot.2.into();
        mst.gc_lnum = self.gc_lnum.into();
        mst.ihead_lnum = self.ihead_lnum.into();
        mst.ihead_offs = self.ihead_offs.into();
        mst.index_size = self.old_idx_sz.into();
        mst.lpt_lnum = self.lpt_result.lpt_lnum.into();
        mst.lpt_offs = self.lpt_result.lpt_offs.into();
        mst.nhead_lnum = self.lpt_result.nhead_lnum.into();
        mst.nhead_offs = self.lpt_result.nhead_offs.into();
        mst.ltab_lnum = self.lpt_result.ltab_lnum.into();
        mst.ltab_offs = self.lpt_result.ltab_offs.into();
        mst.lsave_lnum = self.lpt_result.lsave_lnum.into();
        mst.lsave_offs = self.lpt_result.lsave_offs.into();
        mst.lscan_lnum = self.geo.main_first.into();
        mst.empty_lebs = lst.empty_lebs.into();
        mst.idx_lebs = lst.idx_lebs.into();
        mst.total_free = lst.total_free.into();
        mst.total_dirty = lst.total_dirty.into();
        mst.total_used = lst.total_used.into();
        mst.total_dead = lst.total_dead.into();
        mst.total_dark = lst.total_dark.into();
        mst.leb_cnt = self.leb_cnt.into();

        if self.auth.is_some() {
            let hash_len = self.hash_len();
            mst.hash_root_idx[..hash_len].copy_from_slice(&self.root_idx_hash[..hash_len]);
            mst.hash_lpt[..hash_len].copy_from_slice(&self.lpt_result.hash[..hash_len]);
        }

        // Both copies carry the same bytes, sequence number included.
        let mut node = mst.as_bytes().to_vec();
        let sqnum = self.next_sqnum();
        prepare_node(&mut node, sqnum);
        self.write_prepared_node_leb(&node, UBIFS_MST_LNUM)?;
        self.write_prepared_node_leb(&node, UBIFS_MST_LNUM + 1)?;

        if let Some(auth) = &self.auth {
            auth.node_hash(&node, &mut self.mst_hash)?;
        }
        Ok(())
    }

    fn write_super(&mut self) -> Result<()> {
        let mut sup = SbNode::new_zeroed();
        sup.ch.node_type = UBIFS_SB_NODE;
        sup.key_hash = self.geo.key_hash_code();
        sup.key_fmt = UBIFS_SIMPLE_KEY_FMT;
        sup.min_io_size = self.geo.min_io_size.into();
        sup.leb_size = self.geo.leb_size.into();
        sup.leb_cnt = self.leb_cnt.into();
        sup.max_leb_cnt = self.geo.max_leb_cnt.into();
        sup.max_bud_bytes = self.geo.max_bud_bytes.into();
        sup.log_lebs = self.geo.log_lebs.into();
        sup.lpt_lebs = self.geo.lpt.lpt_lebs.into();
        sup.orph_lebs = self.geo.orph_lebs.into();
        sup.jhead_cnt = JHEAD_CNT.into();
        sup.fanout = self.geo.fanout.into();
        sup.lsave_cnt = self.geo.lsave_cnt.into();
        sup.fmt_version = self.geo.fmt_version().into();
        sup.default_compr = self.compressor.on_flash_default().into();
        sup.rp_size = self.geo.rp_size.into();
        sup.time_gran = UBIFS_DEFAULT_TIME_GRAN.into();

        let uuid = match self.geo.uuid {
            Some(uuid) => uuid,
            None => {
                let mut uuid = [0u8; 16];
                rand::rng().fill(&mut uuid[..]);
                // RFC 4122 version 4, variant 1
                uuid[6] = (uuid[6] & 0x0F) | 0x40;
                uuid[8] = (uuid[8] & 0x3F) | 0x80;
                uuid
            }
        };
        sup.uuid = uuid;

        let mut flags = 0;
        if self.geo.lpt.big_lpt {
            flags |= UBIFS_FLG_BIGLPT;
        }
        if self.geo.space_fixup {
            flags |= UBIFS_FLG_SPACE_FIXUP;
        }
        if self.geo.double_hash {
            flags |= UBIFS_FLG_DOUBLE_HASH;
        }
        if self.geo.encrypted {
            flags |= UBIFS_FLG_ENCRYPTION;
        }
        if self.auth.is_some() {
            flags |= UBIFS_FLG_AUTHENTICATION;
            let hash_len = self.hash_len();
            sup.hash_algo = self.geo.auth.as_ref().unwrap().hash_algo.on_flash_code().into();
            sup.hash_mst[..hash_len].copy_from_slice(&self.mst_hash[..hash_len]);
        }
        sup.flags = flags.into();

        let mut node = sup.as_bytes().to_vec();
        let sqnum = self.next_sqnum();
        prepare_node(&mut node, sqnum);

        self.leb_buf.fill(0xFF);
        self.leb_buf[..UBIFS_SB_NODE_SZ].copy_from_slice(&node);

        if let Some(auth) = &self.auth {
            let der = auth.sign_superblock(&node)?;

            let mut sig = SigNode::new_zeroed();
            sig.ch.node_type = UBIFS_SIG_NODE;
            sig.sig_type = UBIFS_SIGNATURE_TYPE_PKCS7.into();
            sig.len = (der.len() as u32).into();

            let mut sig_node = Vec::with_capacity(UBIFS_SIG_NODE_SZ + der.len());
            sig_node.extend_from_slice(sig.as_bytes());
            sig_node.extend_from_slice(&der);
            let sqnum = self.next_sqnum();
            prepare_node(&mut sig_node, sqnum);

            let wlen = align_up(
                align_up(sig_node.len(), 8),
                self.geo.min_io_size as usize,
            );
            let start = UBIFS_SB_NODE_SZ;
            self.leb_buf[start..start + sig_node.len()].copy_from_slice(&sig_node);
            self.leb_buf[start + sig_node.len()..start + wlen].fill(0);
        }

        self.target.leb_change(UBIFS_SB_LNUM, &self.leb_buf)
    }

    /// Writes the log: a commit start node, then empty LEBs.
    fn write_log(&mut self) -> Result<()> {
        let mut cs = CsNode::new_zeroed();
        cs.ch.node_type = UBIFS_CS_NODE;
        cs.cmt_no = 0.into();
        let mut node = cs.as_bytes().to_vec();
        self.write_node_leb(&mut node, UBIFS_LOG_LNUM)?;

        for i in 1..self.geo.log_lebs {
            self.write_empty_leb(UBIFS_LOG_LNUM + i)?;
        }
        Ok(())
    }

    fn write_orphan_area(&mut self) -> Result<()> {
        let first = UBIFS_LOG_LNUM + self.geo.log_lebs + self.geo.lpt.lpt_lebs;
        for i in 0..self.geo.orph_lebs {
            self.write_empty_leb(first + i)?;
        }
        Ok(())
    }
}
