//! mkfs-ubifs - Make a UBIFS file system image from an existing directory
//! tree, writing either to an image file or directly to a UBI volume.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use mkfs_ubifs::{
    auth::HashAlgo,
    compress::Selection,
    geometry::{parse_bytes, AuthConfig, Config, EncryptionConfig, Geometry},
    key::NameHash,
    mkfs, FileTarget, UbiVolume,
};

/// Make a UBIFS file system image from an existing directory tree.
///
/// Sizes are specified in bytes and may carry a KiB, MiB or GiB suffix.
/// When the target is a UBI volume, the minimum I/O unit and LEB size are
/// taken from the volume itself.
#[derive(Parser, Debug)]
#[command(name = "mkfs-ubifs", version, about)]
struct Args {
    /// Build the file system from directory DIR.
    #[arg(short, long, visible_short_alias = 'd', value_name = "DIR")]
    root: Option<PathBuf>,

    /// Minimum I/O unit size.
    #[arg(short = 'm', long, value_name = "SIZE")]
    min_io_size: Option<String>,

    /// Logical erase block size.
    #[arg(short = 'e', long, value_name = "SIZE")]
    leb_size: Option<String>,

    /// Maximum logical erase block count.
    #[arg(short = 'c', long, value_name = "COUNT")]
    max_leb_cnt: Option<u32>,

    /// Output file.
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Journal size.
    #[arg(short, long, value_name = "SIZE")]
    jrn_size: Option<String>,

    /// How much space should be reserved for the super-user.
    #[arg(short = 'R', long, value_name = "SIZE")]
    reserved: Option<String>,

    /// Compression type: "none", "lzo", "favor_lzo", "zlib" or "zstd".
    #[arg(short = 'x', long, value_name = "TYPE")]
    compr: Option<String>,

    /// How many percent better zlib must compress for favor_lzo to pick it.
    #[arg(short = 'X', long, value_name = "NUM", default_value_t = 20)]
    favor_percent: u32,

    /// Fanout of the index tree.
    #[arg(short, long, value_name = "NUM", default_value_t = 8)]
    fanout: u32,

    /// Force space fixup on first mount.
    #[arg(short = 'F', long)]
    space_fixup: bool,

    /// Key hash type: "r5" or "test".
    #[arg(short, long, value_name = "TYPE", default_value = "r5")]
    keyhash: String,

    /// Count of erase blocks for the log.
    #[arg(short, long, value_name = "COUNT")]
    log_lebs: Option<u32>,

    /// Count of erase blocks for orphans.
    #[arg(short = 'p', long, value_name = "COUNT", default_value_t = 1)]
    orph_lebs: u32,

    /// Use device table FILE.
    #[arg(short = 'D', long, value_name = "FILE")]
    devtable: Option<PathBuf>,

    /// Squash owners, making all files owned by root.
    #[arg(short = 'U', long = "squash-uids")]
    squash_uids: bool,

    /// Record each file's image inode number in a user.image-inode-number
    /// extended attribute.
    #[arg(short = 'a', long = "set-inum-attr")]
    set_inum_attr: bool,

    /// Load an encryption key from the specified file.
    #[arg(short = 'K', long, value_name = "FILE")]
    key: Option<PathBuf>,

    /// The encryption key descriptor as a hex string.
    #[arg(short = 'b', long, value_name = "HEX")]
    key_descriptor: Option<String>,

    /// Padding policy for encrypting filenames: 4, 8, 16 or 32.
    #[arg(short = 'P', long, value_name = "NUM", default_value_t = 4)]
    padding: u32,

    /// Cipher for file level encryption.
    #[arg(short = 'C', long, value_name = "NAME", default_value = "AES-256-XTS")]
    cipher: String,

    /// Hash algorithm for signed images: sha1, sha256 or sha512.
    #[arg(long, value_name = "NAME")]
    hash_algo: Option<String>,

    /// File containing the authentication key for signing.
    #[arg(long, value_name = "FILE")]
    auth_key: Option<PathBuf>,

    /// Authentication certificate file for signing.
    #[arg(long, value_name = "FILE")]
    auth_cert: Option<PathBuf>,

    /// Verbose operation.
    #[arg(short, long)]
    verbose: bool,

    /// The output image file or UBI volume.
    target: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let target_path = match (&args.output, &args.target) {
        (Some(path), _) | (None, Some(path)) => path.clone(),
        (None, None) => bail!("no output file or UBI volume specified"),
    };

    // A UBI volume dictates the flash geometry.
    let volume = if UbiVolume::is_ubi_volume(&target_path) {
        Some(UbiVolume::open(&target_path)?)
    } else {
        None
    };

    let min_io_size = match (&volume, &args.min_io_size) {
        (Some(vol), _) => vol.min_io_size,
        (None, Some(text)) => parse_bytes(text)?.try_into().context("bad min. I/O size")?,
        (None, None) => bail!("min. I/O unit was not specified"),
    };
    let leb_size = match (&volume, &args.leb_size) {
        (Some(vol), _) => vol.leb_size,
        (None, Some(text)) => parse_bytes(text)?.try_into().context("bad LEB size")?,
        (None, None) => bail!("LEB size was not specified"),
    };
    let max_leb_cnt = match args.max_leb_cnt {
        Some(count) => count,
        None => bail!("maximum count of LEBs was not specified"),
    };

    let mut cfg = Config::new(min_io_size, leb_size, max_leb_cnt);
    cfg.root = args.root;
    cfg.fanout = args.fanout;
    cfg.orph_lebs = args.orph_lebs;
    cfg.log_lebs = args.log_lebs;
    cfg.favor_percent = args.favor_percent;
    cfg.space_fixup = args.space_fixup;
    cfg.squash_owner = args.squash_uids;
    cfg.set_inum_attr = args.set_inum_attr;
    cfg.devtable = args.devtable;

    if let Some(text) = &args.jrn_size {
        cfg.jrn_size = Some(parse_bytes(text)?);
    }
    if let Some(text) = &args.reserved {
        cfg.reserved = parse_bytes(text)?;
    }
    if let Some(name) = &args.compr {
        cfg.compr = Some(Selection::from_name(name).with_context(|| format!("bad compressor name '{name}'"))?);
    }
    cfg.key_hash = match args.keyhash.as_str() {
        "r5" => NameHash::R5,
        "test" => NameHash::Test,
        other => bail!("bad key hash '{other}'"),
    };

    if args.key.is_some() || args.key_descriptor.is_some() {
        let Some(key_file) = args.key else {
            bail!("no key file specified");
        };
        cfg.encryption = Some(EncryptionConfig {
            key_file,
            key_descriptor: args.key_descriptor,
            cipher: args.cipher,
            padding: args.padding,
        });
    }

    if args.hash_algo.is_some() || args.auth_key.is_some() || args.auth_cert.is_some() {
        let (Some(name), Some(key_file), Some(cert_file)) =
            (&args.hash_algo, args.auth_key, args.auth_cert)
        else {
            bail!("authentication requires --hash-algo, --auth-key and --auth-cert");
        };
        let hash_algo =
            HashAlgo::from_name(name).with_context(|| format!("bad hash algorithm '{name}'"))?;
        cfg.auth = Some(AuthConfig {
            hash_algo,
            key_file,
            cert_file,
        });
    }

    let geo = Geometry::new(cfg)?;

    let result = match volume {
        Some(mut vol) => mkfs(&geo, &mut vol),
        None => {
            let mut file = FileTarget::create(&target_path, geo.leb_size)?;
            let result = mkfs(&geo, &mut file);
            if result.is_err() {
                // Never leave a partial image behind.
                let _ = std::fs::remove_file(&target_path);
            }
            result
        }
    };

    let leb_cnt = result?;
    if args.verbose {
        println!("built {} LEBs of {} bytes", leb_cnt, geo.leb_size);
    }
    Ok(())
}
