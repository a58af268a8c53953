//! End-to-end image tests: build real images from temporary trees, then
//! re-parse them node by node.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use similar_asserts::assert_eq;
use zerocopy::FromBytes;

use mkfs_ubifs::compress::Selection;
use mkfs_ubifs::crc::crc32;
use mkfs_ubifs::error::Error;
use mkfs_ubifs::format::*;
use mkfs_ubifs::key::Key;
use mkfs_ubifs::util::align_up;
use mkfs_ubifs::{mkfs, Config, FileTarget, Geometry};

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;
const S_IFCHR: u32 = 0o020000;

const TEST_UUID: [u8; 16] = *b"mkfs-ubifs-tests";

fn test_config(root: Option<&Path>) -> Config {
    let mut cfg = Config::new(2048, 126976, 100);
    cfg.root = root.map(Path::to_path_buf);
    cfg.compr = Some(Selection::None);
    cfg.uuid = Some(TEST_UUID);
    cfg
}

fn build_image(cfg: Config) -> Vec<u8> {
    try_build_image(cfg).unwrap()
}

fn try_build_image(cfg: Config) -> Result<Vec<u8>, Error> {
    let geo = Geometry::new(cfg)?;
    let file = tempfile::tempfile().unwrap();
    let mut target = FileTarget::new(file.try_clone().unwrap(), geo.leb_size);
    mkfs(&geo, &mut target)?;

    let mut file = file;
    file.seek(SeekFrom::Start(0)).unwrap();
    let mut image = Vec::new();
    file.read_to_end(&mut image).unwrap();
    Ok(image)
}

#[derive(Debug, Clone)]
struct ScannedNode {
    lnum: u32,
    offs: usize,
    node_type: u8,
    sqnum: u64,
    bytes: Vec<u8>,
}

fn leb(image: &[u8], lnum: u32) -> &[u8] {
    &image[lnum as usize * 126976..][..126976]
}

/// Walks the nodes of one LEB, validating magic and CRC, and checks that
/// everything after the last node is fill (0xFF) or small-gap padding bytes.
fn scan_leb(image: &[u8], lnum: u32) -> Vec<ScannedNode> {
    let data = leb(image, lnum);
    let mut nodes = Vec::new();
    let mut offs = 0;

    while offs + UBIFS_CH_SZ <= data.len() {
        if data[offs..offs + 4] != UBIFS_NODE_MAGIC.to_le_bytes() {
            break;
        }
        let (ch, _) = CommonHeader::ref_from_prefix(&data[offs..]).unwrap();
        let len = ch.len.get() as usize;
        assert!(offs + len <= data.len(), "node overruns LEB {lnum}");
        assert_eq!(
            ch.crc.get(),
            crc32(UBIFS_CRC32_INIT, &data[offs + 8..offs + len]),
            "bad CRC at {lnum}:{offs}"
        );
        nodes.push(ScannedNode {
            lnum,
            offs,
            node_type: ch.node_type,
            sqnum: ch.sqnum.get(),
            bytes: data[offs..offs + len].to_vec(),
        });
        if ch.node_type == UBIFS_PAD_NODE {
            let (pad, _) = PadNode::ref_from_prefix(&data[offs..]).unwrap();
            offs += UBIFS_PAD_NODE_SZ + pad.pad_len.get() as usize;
        } else {
            offs += align_up(len, 8);
        }
    }

    assert!(
        data[offs..]
            .iter()
            .all(|&b| b == 0xFF || b == UBIFS_PADDING_BYTE),
        "unexpected bytes after the last node in LEB {lnum}"
    );
    nodes
}

fn scan_main(image: &[u8], geo: &Geometry, leb_cnt: u32) -> Vec<ScannedNode> {
    let mut nodes = Vec::new();
    for lnum in geo.main_first..leb_cnt {
        nodes.extend(scan_leb(image, lnum));
    }
    nodes
}

fn parse_sb(image: &[u8]) -> SbNode {
    let nodes = scan_leb(image, UBIFS_SB_LNUM);
    assert_eq!(nodes[0].node_type, UBIFS_SB_NODE);
    *SbNode::ref_from_prefix(&nodes[0].bytes).unwrap().0
}

fn parse_mst(image: &[u8]) -> MstNode {
    let nodes = scan_leb(image, UBIFS_MST_LNUM);
    assert_eq!(nodes[0].node_type, UBIFS_MST_NODE);
    *MstNode::ref_from_prefix(&nodes[0].bytes).unwrap().0
}

fn node_key(bytes: &[u8]) -> (u32, u32) {
    let inum = u32::from_le_bytes(bytes[24..28].try_into().unwrap());
    let aux = u32::from_le_bytes(bytes[28..32].try_into().unwrap());
    (inum, aux)
}

fn dent_name(bytes: &[u8]) -> &[u8] {
    let (dent, _) = DentNode::ref_from_prefix(bytes).unwrap();
    &bytes[UBIFS_DENT_NODE_SZ..UBIFS_DENT_NODE_SZ + dent.nlen.get() as usize]
}

/// Recursively walks the on-flash index, collecting leaf branch targets and
/// branch keys in traversal order.
fn walk_index(
    image: &[u8],
    lnum: u32,
    offs: u32,
    len: u32,
    leaves: &mut Vec<(u32, u32, u32)>,
    keys: &mut Vec<(u32, u32)>,
) -> u16 {
    let data = &leb(image, lnum)[offs as usize..][..len as usize];
    assert_eq!(data[0..4], UBIFS_NODE_MAGIC.to_le_bytes());
    let (idx, _) = IdxNode::ref_from_prefix(data).unwrap();
    assert_eq!(idx.ch.node_type, UBIFS_IDX_NODE);
    let level = idx.level.get();

    let stride = UBIFS_BRANCH_SZ + UBIFS_SK_LEN;
    for i in 0..idx.child_cnt.get() as usize {
        let at = UBIFS_IDX_NODE_SZ + i * stride;
        let (branch, _) = Branch::ref_from_prefix(&data[at..]).unwrap();
        let key_at = at + UBIFS_BRANCH_SZ;
        keys.push((
            u32::from_le_bytes(data[key_at..key_at + 4].try_into().unwrap()),
            u32::from_le_bytes(data[key_at + 4..key_at + 8].try_into().unwrap()),
        ));
        if level == 0 {
            leaves.push((branch.lnum.get(), branch.offs.get(), branch.len.get()));
        } else {
            walk_index(
                image,
                branch.lnum.get(),
                branch.offs.get(),
                branch.len.get(),
                leaves,
                keys,
            );
        }
    }
    level
}

/// Full-image consistency checks shared by the scenarios: superblock and
/// master agreement, unique sequence numbers, and an index walk that must
/// reproduce exactly the emitted leaves.
fn check_image(image: &[u8], geo: &Geometry) -> (SbNode, MstNode, Vec<ScannedNode>) {
    let sb = parse_sb(image);
    assert_eq!(sb.ch.magic.get(), UBIFS_NODE_MAGIC);
    let leb_cnt = sb.leb_cnt.get();
    assert_eq!(image.len(), leb_cnt as usize * geo.leb_size as usize);

    // The two master LEBs are byte-identical.
    assert_eq!(leb(image, UBIFS_MST_LNUM), leb(image, UBIFS_MST_LNUM + 1));
    let mst = parse_mst(image);
    assert_eq!(mst.leb_cnt.get(), leb_cnt);
    assert_ne!(mst.flags.get() & UBIFS_MST_NO_ORPHS, 0);

    let main = scan_main(image, geo, leb_cnt);

    // Sequence numbers increase in emission order and are unique image-wide.
    let mut sqnums: Vec<u64> = main.iter().filter(|n| n.node_type != UBIFS_PAD_NODE).map(|n| n.sqnum).collect();
    assert!(sqnums.windows(2).all(|w| w[0] < w[1]));
    sqnums.push(mst.ch.sqnum.get());
    sqnums.push(sb.ch.sqnum.get());
    let unique: std::collections::BTreeSet<u64> = sqnums.iter().copied().collect();
    assert_eq!(unique.len(), sqnums.len());

    // The index walk reproduces exactly the set of emitted leaves.
    let mut leaves = Vec::new();
    let mut keys = Vec::new();
    walk_index(
        image,
        mst.root_lnum.get(),
        mst.root_offs.get(),
        mst.root_len.get(),
        &mut leaves,
        &mut keys,
    );
    let mut emitted: Vec<(u32, u32, u32)> = main
        .iter()
        .filter(|n| n.node_type != UBIFS_IDX_NODE && n.node_type != UBIFS_PAD_NODE)
        .map(|n| (n.lnum, n.offs as u32, n.bytes.len() as u32))
        .collect();
    let mut indexed = leaves.clone();
    emitted.sort();
    indexed.sort();
    assert_eq!(indexed, emitted);

    (sb, mst, main)
}

fn nodes_of_type(nodes: &[ScannedNode], node_type: u8) -> Vec<&ScannedNode> {
    nodes.iter().filter(|n| n.node_type == node_type).collect()
}

/// Main-area nodes that are indexed leaves (not index or padding nodes).
fn leaf_nodes(nodes: &[ScannedNode]) -> Vec<&ScannedNode> {
    nodes
        .iter()
        .filter(|n| {
            matches!(
                n.node_type,
                UBIFS_INO_NODE | UBIFS_DENT_NODE | UBIFS_XENT_NODE | UBIFS_DATA_NODE
            )
        })
        .collect()
}

#[test]
fn test_single_file_image() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("hello"), "hi\n").unwrap();
    fs::set_permissions(dir.path().join("hello"), fs::Permissions::from_mode(0o644)).unwrap();

    let cfg = test_config(Some(dir.path()));
    let geo = Geometry::new(cfg.clone()).unwrap();
    let image = build_image(cfg);

    let (sb, mst, main) = check_image(&image, &geo);

    assert_eq!(sb.min_io_size.get(), 2048);
    assert_eq!(sb.leb_size.get(), 126976);
    assert_eq!(sb.max_leb_cnt.get(), 100);
    assert_eq!(sb.fmt_version.get(), 4);
    assert_eq!(sb.default_compr.get(), 0);
    assert_eq!(sb.key_hash, UBIFS_KEY_HASH_R5);
    assert_eq!(sb.uuid, TEST_UUID);
    assert_eq!(sb.log_lebs.get(), geo.log_lebs);
    assert_eq!(sb.orph_lebs.get(), 1);
    assert_eq!(sb.flags.get(), 0);

    // main area: one data LEB, the GC reserve, one index LEB
    assert_eq!(sb.leb_cnt.get(), geo.main_first + 3);
    assert_eq!(mst.gc_lnum.get(), geo.main_first + 1);
    assert_eq!(mst.empty_lebs.get(), 1);
    assert_eq!(mst.idx_lebs.get(), 1);
    assert_eq!(mst.highest_inum.get(), UBIFS_FIRST_INO + 1);

    let datas = nodes_of_type(&main, UBIFS_DATA_NODE);
    assert_eq!(datas.len(), 1);
    let (dn, _) = DataNode::ref_from_prefix(&datas[0].bytes).unwrap();
    assert_eq!(datas[0].bytes.len(), UBIFS_DATA_NODE_SZ + 3);
    assert_eq!(dn.size.get(), 3);
    assert_eq!(dn.compr_type.get(), 0);
    let file_inum = UBIFS_FIRST_INO as u32 + 1;
    assert_eq!(node_key(&datas[0].bytes), (file_inum, 1 << 29));
    assert_eq!(&datas[0].bytes[UBIFS_DATA_NODE_SZ..], b"hi\n");

    let dents = nodes_of_type(&main, UBIFS_DENT_NODE);
    assert_eq!(dents.len(), 1);
    let (dent, _) = DentNode::ref_from_prefix(&dents[0].bytes).unwrap();
    assert_eq!(dent_name(&dents[0].bytes), b"hello");
    assert_eq!(dent.inum.get(), UBIFS_FIRST_INO + 1);
    assert_eq!(dent.dtype, UBIFS_ITYPE_REG);
    assert_eq!(node_key(&dents[0].bytes).0, UBIFS_ROOT_INO as u32);
    let expected_key = Key::dent(UBIFS_ROOT_INO, geo.key_hash, b"hello");
    assert_eq!(node_key(&dents[0].bytes).1, expected_key.aux);

    let inos = nodes_of_type(&main, UBIFS_INO_NODE);
    assert_eq!(inos.len(), 2);
    for node in &inos {
        let (ino, _) = InoNode::ref_from_prefix(&node.bytes).unwrap();
        match node_key(&node.bytes).0 as u64 {
            UBIFS_ROOT_INO => {
                assert_eq!(ino.mode.get() & S_IFMT, S_IFDIR);
                assert_eq!(ino.nlink.get(), 2);
                assert_eq!(
                    ino.size.get(),
                    (UBIFS_INO_NODE_SZ + calc_dent_size(5)) as u64
                );
            }
            inum => {
                assert_eq!(inum, UBIFS_FIRST_INO + 1);
                assert_eq!(ino.mode.get() & S_IFMT, S_IFREG);
                assert_eq!(ino.mode.get() & 0o7777, 0o644);
                assert_eq!(ino.nlink.get(), 1);
                assert_eq!(ino.size.get(), 3);
            }
        }
    }
}

#[test]
fn test_hardlinks_share_one_inode() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a"), vec![b'x'; 300]).unwrap();
    fs::hard_link(dir.path().join("a"), dir.path().join("b")).unwrap();

    let cfg = test_config(Some(dir.path()));
    let geo = Geometry::new(cfg.clone()).unwrap();
    let image = build_image(cfg);
    let (_, mst, main) = check_image(&image, &geo);

    // One regular inode shared by two dentries, and no gap in numbering.
    assert_eq!(mst.highest_inum.get(), UBIFS_FIRST_INO + 1);

    let dents = nodes_of_type(&main, UBIFS_DENT_NODE);
    assert_eq!(dents.len(), 2);
    for node in &dents {
        let (dent, _) = DentNode::ref_from_prefix(&node.bytes).unwrap();
        assert_eq!(dent.inum.get(), UBIFS_FIRST_INO + 1);
    }

    let inos = nodes_of_type(&main, UBIFS_INO_NODE);
    assert_eq!(inos.len(), 2); // root + the file
    let file_ino = inos
        .iter()
        .find(|n| node_key(&n.bytes).0 as u64 != UBIFS_ROOT_INO)
        .unwrap();
    let (ino, _) = InoNode::ref_from_prefix(&file_ino.bytes).unwrap();
    assert_eq!(ino.nlink.get(), 2);

    assert_eq!(nodes_of_type(&main, UBIFS_DATA_NODE).len(), 1);
}

#[test]
fn test_block_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("exact"), vec![b'a'; UBIFS_BLOCK_SIZE]).unwrap();
    fs::write(dir.path().join("over"), vec![b'b'; UBIFS_BLOCK_SIZE + 1]).unwrap();
    fs::write(dir.path().join("holes"), vec![0u8; 2 * UBIFS_BLOCK_SIZE]).unwrap();
    fs::write(dir.path().join("empty"), b"").unwrap();

    let cfg = test_config(Some(dir.path()));
    let geo = Geometry::new(cfg.clone()).unwrap();
    let image = build_image(cfg);
    let (_, _, main) = check_image(&image, &geo);

    // name -> image inode number
    let mut inum_of = std::collections::HashMap::new();
    for node in nodes_of_type(&main, UBIFS_DENT_NODE) {
        let (dent, _) = DentNode::ref_from_prefix(&node.bytes).unwrap();
        inum_of.insert(dent_name(&node.bytes).to_vec(), dent.inum.get() as u32);
    }

    let data_blocks = |inum: u32| {
        nodes_of_type(&main, UBIFS_DATA_NODE)
            .iter()
            .filter(|n| node_key(&n.bytes).0 == inum)
            .count()
    };
    assert_eq!(data_blocks(inum_of[b"exact".as_slice()]), 1);
    assert_eq!(data_blocks(inum_of[b"over".as_slice()]), 2);
    // all-zero blocks are holes
    assert_eq!(data_blocks(inum_of[b"holes".as_slice()]), 0);
    assert_eq!(data_blocks(inum_of[b"empty".as_slice()]), 0);

    // size survives even when every block was a hole
    let holes_ino = nodes_of_type(&main, UBIFS_INO_NODE)
        .iter()
        .find(|n| node_key(&n.bytes).0 == inum_of[b"holes".as_slice()])
        .map(|n| *InoNode::ref_from_prefix(&n.bytes).unwrap().0)
        .unwrap();
    assert_eq!(holes_ino.size.get(), 2 * UBIFS_BLOCK_SIZE as u64);

    // every data node's block lies within the rounded-up file size
    for node in nodes_of_type(&main, UBIFS_DATA_NODE) {
        let (inum, aux) = node_key(&node.bytes);
        let block = (aux & 0x1FFFFFFF) as u64;
        let ino = nodes_of_type(&main, UBIFS_INO_NODE)
            .iter()
            .find(|n| node_key(&n.bytes).0 == inum)
            .map(|n| *InoNode::ref_from_prefix(&n.bytes).unwrap().0)
            .unwrap();
        assert!(block * (UBIFS_BLOCK_SIZE as u64) < ino.size.get().div_ceil(UBIFS_BLOCK_SIZE as u64) * UBIFS_BLOCK_SIZE as u64);
    }
}

#[test]
fn test_empty_image() {
    let cfg = test_config(None);
    let geo = Geometry::new(cfg.clone()).unwrap();
    let image = build_image(cfg);
    let (sb, mst, main) = check_image(&image, &geo);

    assert_eq!(sb.leb_cnt.get(), geo.main_first + 3);
    assert_eq!(mst.highest_inum.get(), UBIFS_FIRST_INO);

    // Only the root directory inode exists.
    assert_eq!(leaf_nodes(&main).len(), 1);
    let (ino, _) = InoNode::ref_from_prefix(&main[0].bytes).unwrap();
    assert_eq!(node_key(&main[0].bytes).0 as u64, UBIFS_ROOT_INO);
    assert_eq!(ino.mode.get() & S_IFMT, S_IFDIR);
    assert_eq!(ino.nlink.get(), 2);
    assert_eq!(ino.size.get(), UBIFS_INO_NODE_SZ as u64);
}

#[test]
fn test_too_many_lebs() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("big"), vec![b'A'; 200 * 1024]).unwrap();

    let mut cfg = Config::new(8, 15360, 20);
    cfg.root = Some(dir.path().to_path_buf());
    cfg.compr = Some(Selection::None);

    match try_build_image(cfg) {
        Err(Error::TooManyLebs { need, max }) => {
            assert_eq!(max, 20);
            assert!(need > max);
        }
        other => panic!("expected TooManyLebs, got {:?}", other.map(|img| img.len())),
    }
}

#[test]
fn test_rebuild_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("sub")).unwrap();
    fs::write(dir.path().join("sub/file"), vec![b'q'; 5000]).unwrap();
    std::os::unix::fs::symlink("file", dir.path().join("sub/link")).unwrap();

    let first = build_image(test_config(Some(dir.path())));
    let second = build_image(test_config(Some(dir.path())));
    assert_eq!(first, second);
}

#[test]
fn test_multi_level_index() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..300 {
        fs::write(dir.path().join(format!("file-{i:03}")), format!("contents {i}")).unwrap();
    }

    let cfg = test_config(Some(dir.path()));
    let geo = Geometry::new(cfg.clone()).unwrap();
    let image = build_image(cfg);
    let (_, mst, main) = check_image(&image, &geo);

    // 300 files produce ino + dent + data each, plus the root inode.
    assert_eq!(leaf_nodes(&main).len(), 3 * 300 + 1);

    let mut leaves = Vec::new();
    let mut keys = Vec::new();
    let root_level = walk_index(
        &image,
        mst.root_lnum.get(),
        mst.root_offs.get(),
        mst.root_len.get(),
        &mut leaves,
        &mut keys,
    );
    assert!(root_level > 0);
    assert_eq!(leaves.len(), 3 * 300 + 1);
    // In-order traversal of a valid index yields non-decreasing keys.
    assert!(keys.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_device_table() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("README"), "readme\n").unwrap();

    let table = tempfile::NamedTempFile::new().unwrap();
    fs::write(
        table.path(),
        "/dev       d 755 0 0 - - - - -\n\
         /dev/null  c 666 0 0 1 3 0 0 -\n",
    )
    .unwrap();

    let mut cfg = test_config(Some(dir.path()));
    cfg.devtable = Some(table.path().to_path_buf());
    let geo = Geometry::new(cfg.clone()).unwrap();
    let image = build_image(cfg);
    let (_, _, main) = check_image(&image, &geo);

    let mut inum_of = std::collections::HashMap::new();
    for node in nodes_of_type(&main, UBIFS_DENT_NODE) {
        let (dent, _) = DentNode::ref_from_prefix(&node.bytes).unwrap();
        inum_of.insert(dent_name(&node.bytes).to_vec(), (dent.inum.get() as u32, dent.dtype));
    }

    let (dev_inum, dev_type) = inum_of[b"dev".as_slice()];
    assert_eq!(dev_type, UBIFS_ITYPE_DIR);
    let (null_inum, null_type) = inum_of[b"null".as_slice()];
    assert_eq!(null_type, UBIFS_ITYPE_CHR);

    let find_ino = |inum: u32| {
        nodes_of_type(&main, UBIFS_INO_NODE)
            .iter()
            .find(|n| node_key(&n.bytes).0 == inum)
            .map(|n| n.bytes.clone())
            .unwrap()
    };

    let dev_bytes = find_ino(dev_inum);
    let (dev_ino, _) = InoNode::ref_from_prefix(&dev_bytes).unwrap();
    assert_eq!(dev_ino.mode.get(), S_IFDIR | 0o755);

    let null_bytes = find_ino(null_inum);
    let (null_ino, _) = InoNode::ref_from_prefix(&null_bytes).unwrap();
    assert_eq!(null_ino.mode.get(), S_IFCHR | 0o666);
    assert_eq!(null_ino.data_len.get(), 8);
    let rdev = u64::from_le_bytes(null_bytes[UBIFS_INO_NODE_SZ..][..8].try_into().unwrap());
    assert_eq!(rdev, rustix_makedev(1, 3));
}

// Mirrors the Linux dev_t encoding without pulling rustix into the tests.
fn rustix_makedev(major: u64, minor: u64) -> u64 {
    (minor & 0xff) | ((major & 0xfff) << 8) | ((minor & !0xff) << 12) | ((major & !0xfff) << 32)
}

#[test]
fn test_device_table_rejects_regular_files() {
    let table = tempfile::NamedTempFile::new().unwrap();
    fs::write(table.path(), "/foo f 644 0 0 - - - - -\n").unwrap();

    let mut cfg = test_config(None);
    cfg.devtable = Some(table.path().to_path_buf());

    match try_build_image(cfg) {
        Err(Error::DeviceTableInvalid(_)) => {}
        other => panic!("expected DeviceTableInvalid, got {:?}", other.map(|img| img.len())),
    }
}

#[test]
fn test_encrypted_symlink_image() {
    let dir = tempfile::tempdir().unwrap();
    std::os::unix::fs::symlink("/target", dir.path().join("link")).unwrap();

    let mut key_file = tempfile::NamedTempFile::new().unwrap();
    key_file.write_all(&[0x5A; 64]).unwrap();

    let mut cfg = test_config(Some(dir.path()));
    cfg.encryption = Some(mkfs_ubifs::geometry::EncryptionConfig {
        key_file: key_file.path().to_path_buf(),
        key_descriptor: Some("0123456789abcdef".to_string()),
        cipher: "AES-256-XTS".to_string(),
        padding: 16,
    });
    let geo = Geometry::new(cfg.clone()).unwrap();
    let image = build_image(cfg);
    let (sb, _, main) = check_image(&image, &geo);

    assert_eq!(sb.fmt_version.get(), 5);
    assert_ne!(sb.flags.get() & UBIFS_FLG_ENCRYPTION, 0);
    assert_ne!(sb.flags.get() & UBIFS_FLG_DOUBLE_HASH, 0);

    // The dentry name is encrypted and padded to the 16-byte policy.
    let dents = nodes_of_type(&main, UBIFS_DENT_NODE);
    assert_eq!(dents.len(), 1);
    let (dent, _) = DentNode::ref_from_prefix(&dents[0].bytes).unwrap();
    assert_eq!(dent.nlen.get(), 16);
    assert_ne!(dent_name(&dents[0].bytes), b"link");

    // The symlink target is stored as a ciphertext-length header, the
    // padded ciphertext, and a trailing NUL.
    let link = nodes_of_type(&main, UBIFS_INO_NODE)
        .iter()
        .find(|n| {
            let (ino, _) = InoNode::ref_from_prefix(&n.bytes).unwrap();
            ino.mode.get() & S_IFMT == S_IFLNK
        })
        .map(|n| *InoNode::ref_from_prefix(&n.bytes).unwrap().0)
        .unwrap();
    assert_eq!(link.data_len.get(), (2 + 16 + 1) as u32);
    assert_ne!(link.flags.get() & UBIFS_CRYPT_FL, 0);

    // Every encrypted inode carries its encryption context xattr.
    let xents = nodes_of_type(&main, UBIFS_XENT_NODE);
    assert!(!xents.is_empty());
    assert!(xents.iter().any(|n| dent_name(&n.bytes) == b"c"));
}

#[test]
fn test_xattr_accounting() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("plain"), "data").unwrap();

    let mut cfg = test_config(Some(dir.path()));
    cfg.set_inum_attr = true;
    let geo = Geometry::new(cfg.clone()).unwrap();
    let image = build_image(cfg);
    let (_, mst, main) = check_image(&image, &geo);

    // Each of the two inodes (root, file) gets the inum attribute: an xattr
    // entry plus a value-carrying inode.
    let xents = nodes_of_type(&main, UBIFS_XENT_NODE);
    assert_eq!(xents.len(), 2);
    for node in &xents {
        assert_eq!(dent_name(&node.bytes), b"user.image-inode-number");
    }
    // root(1) + file + two xattr inodes
    assert_eq!(nodes_of_type(&main, UBIFS_INO_NODE).len(), 4);
    assert_eq!(mst.highest_inum.get(), UBIFS_FIRST_INO + 3);

    // The host inode accounts for its xattrs.
    let file_ino = nodes_of_type(&main, UBIFS_INO_NODE)
        .iter()
        .map(|n| *InoNode::ref_from_prefix(&n.bytes).unwrap().0)
        .find(|ino| ino.mode.get() & S_IFMT == S_IFREG && ino.flags.get() & UBIFS_XATTR_FL == 0 && ino.xattr_cnt.get() > 0)
        .unwrap();
    assert_eq!(file_ino.xattr_cnt.get(), 1);
    assert_eq!(file_ino.size.get(), 4); // the file's own 4 bytes of content
    let name_len = b"user.image-inode-number".len();
    assert_eq!(file_ino.xattr_names.get(), name_len as u32);
    assert_eq!(
        file_ino.xattr_size.get(),
        (calc_dent_size(name_len) + calc_xattr_bytes(2)) as u32
    );
}
