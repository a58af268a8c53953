//! The fscrypt (v1) encryption capability.
//!
//! Every encrypted inode carries an encryption context xattr naming the
//! master key descriptor and a per-inode nonce.  The per-inode key is derived
//! from the master key with AES-128-ECB keyed by the nonce.  File names use
//! AES-256-CBC with ciphertext stealing, file contents and symlink targets
//! use AES-256-XTS with the block number as tweak.

use std::path::Path;

use openssl::symm::{Cipher, Crypter, Mode};
use rand::Rng;
use zerocopy::{Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};
use crate::format::UBIFS_MAX_INO_DATA;

pub const FS_KEY_DESCRIPTOR_SIZE: usize = 8;
pub const FS_KEY_DERIVATION_NONCE_SIZE: usize = 16;
pub const FS_MAX_KEY_SIZE: usize = 64;
pub const FS_CRYPTO_BLOCK_SIZE: usize = 16;

pub const FS_ENCRYPTION_CONTEXT_FORMAT_V1: u8 = 1;
pub const FS_ENCRYPTION_MODE_AES_256_XTS: u8 = 1;
pub const FS_ENCRYPTION_MODE_AES_256_CTS: u8 = 4;

pub const FS_POLICY_FLAGS_PAD_MASK: u8 = 0x03;

/// The xattr under which the encryption context is stored.
pub const UBIFS_XATTR_NAME_ENCRYPTION_CONTEXT: &str = "c";

/// Bytes the on-flash symlink data adds around the encrypted target: the
/// 16-bit ciphertext length up front and a trailing NUL.
pub const SYMLINK_DATA_OVERHEAD: usize = 3;

/// The on-flash encryption context (the value of the `c` xattr).
#[derive(Clone, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct FscryptContext {
    pub format: u8,
    pub contents_encryption_mode: u8,
    pub filenames_encryption_mode: u8,
    pub flags: u8,
    pub master_key_descriptor: [u8; FS_KEY_DESCRIPTOR_SIZE],
    pub nonce: [u8; FS_KEY_DERIVATION_NONCE_SIZE],
}

fn openssl_err(e: openssl::error::ErrorStack) -> Error {
    Error::EncryptionFailed(e.to_string())
}

fn evp_encrypt(cipher: Cipher, key: &[u8], iv: Option<&[u8]>, data: &[u8]) -> Result<Vec<u8>> {
    let mut crypter = Crypter::new(cipher, Mode::Encrypt, key, iv).map_err(openssl_err)?;
    crypter.pad(false);
    let mut out = vec![0; data.len() + cipher.block_size()];
    let mut n = crypter.update(data, &mut out).map_err(openssl_err)?;
    n += crypter.finalize(&mut out[n..]).map_err(openssl_err)?;
    out.truncate(n);
    Ok(out)
}

/// AES-256-CBC with ciphertext stealing (CS3), zero IV: the fscrypt name
/// encryption.  `data` must be at least one cipher block long.
fn cbc_cts_encrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let len = data.len();
    debug_assert!(len >= FS_CRYPTO_BLOCK_SIZE);
    let blocks = len.div_ceil(FS_CRYPTO_BLOCK_SIZE);

    let mut padded = data.to_vec();
    padded.resize(blocks * FS_CRYPTO_BLOCK_SIZE, 0);
    let ct = evp_encrypt(Cipher::aes_256_cbc(), key, Some(&[0u8; 16]), &padded)?;

    if blocks == 1 {
        return Ok(ct);
    }

    // CS3 swaps the last two blocks unconditionally and truncates the
    // (now trailing) next-to-last block to the partial length.
    let tail = len - FS_CRYPTO_BLOCK_SIZE * (blocks - 1);
    let full = FS_CRYPTO_BLOCK_SIZE * (blocks - 2);
    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(&ct[..full]);
    out.extend_from_slice(&ct[full + FS_CRYPTO_BLOCK_SIZE..]);
    out.extend_from_slice(&ct[full..full + tail]);
    Ok(out)
}

/// Holds the master key and image-wide encryption policy.
pub struct Cryptor {
    master_key: [u8; FS_MAX_KEY_SIZE],
    descriptor: [u8; FS_KEY_DESCRIPTOR_SIZE],
    flags: u8,
}

impl Cryptor {
    pub fn new(
        key_file: &Path,
        key_descriptor: Option<&str>,
        cipher: &str,
        padding: u32,
    ) -> Result<Cryptor> {
        if !cipher.eq_ignore_ascii_case("AES-256-XTS") {
            return Err(Error::InvalidOption(format!("unsupported cipher '{cipher}'")));
        }

        let flags = match padding {
            4 => 0,
            8 => 1,
            16 => 2,
            32 => 3,
            _ => {
                return Err(Error::InvalidOption(format!(
                    "invalid padding policy '{padding}'"
                )))
            }
        };

        let raw = std::fs::read(key_file).map_err(|e| Error::source_io(key_file, e))?;
        if raw.len() != FS_MAX_KEY_SIZE {
            return Err(Error::InvalidOption(format!(
                "key file must contain {FS_MAX_KEY_SIZE} bytes"
            )));
        }
        let mut master_key = [0u8; FS_MAX_KEY_SIZE];
        master_key.copy_from_slice(&raw);

        let mut descriptor = [0u8; FS_KEY_DESCRIPTOR_SIZE];
        match key_descriptor {
            Some(text) => hex::decode_to_slice(text, &mut descriptor)
                .map_err(|e| Error::InvalidOption(format!("bad key descriptor: {e}")))?,
            None => {
                let digest = openssl::hash::hash(openssl::hash::MessageDigest::sha512(), &raw)
                    .map_err(openssl_err)?;
                descriptor.copy_from_slice(&digest[..FS_KEY_DESCRIPTOR_SIZE]);
            }
        }

        Ok(Cryptor {
            master_key,
            descriptor,
            flags,
        })
    }

    /// Creates the context for the root directory.
    pub fn root_context(&self) -> Result<InodeCrypt> {
        self.fresh_context()
    }

    /// Creates the context a child inode inherits from its parent directory:
    /// the same policy under a fresh nonce.
    pub fn inherit(&self, _parent: &InodeCrypt) -> Result<InodeCrypt> {
        self.fresh_context()
    }

    fn fresh_context(&self) -> Result<InodeCrypt> {
        let mut nonce = [0u8; FS_KEY_DERIVATION_NONCE_SIZE];
        rand::rng().fill(&mut nonce[..]);

        let context = FscryptContext {
            format: FS_ENCRYPTION_CONTEXT_FORMAT_V1,
            contents_encryption_mode: FS_ENCRYPTION_MODE_AES_256_XTS,
            filenames_encryption_mode: FS_ENCRYPTION_MODE_AES_256_CTS,
            flags: self.flags,
            master_key_descriptor: self.descriptor,
            nonce,
        };

        // fscrypt v1 key derivation: AES-128-ECB keyed with the nonce,
        // applied to the master key.
        let derived = evp_encrypt(Cipher::aes_128_ecb(), &nonce, None, &self.master_key)?;
        let mut enc_key = [0u8; FS_MAX_KEY_SIZE];
        enc_key.copy_from_slice(&derived[..FS_MAX_KEY_SIZE]);

        Ok(InodeCrypt { context, enc_key })
    }
}

/// The per-inode encryption state: the context written to the inode's `c`
/// xattr and the derived key.
pub struct InodeCrypt {
    context: FscryptContext,
    enc_key: [u8; FS_MAX_KEY_SIZE],
}

impl InodeCrypt {
    pub fn context_bytes(&self) -> &[u8] {
        self.context.as_bytes()
    }

    fn padding(&self) -> usize {
        4 << (self.context.flags & FS_POLICY_FLAGS_PAD_MASK)
    }

    /// The ciphertext size of a name of `len` bytes under the padding policy.
    pub fn encrypted_name_len(&self, len: usize) -> usize {
        let len = len.max(FS_CRYPTO_BLOCK_SIZE);
        len.div_ceil(self.padding()) * self.padding()
    }

    /// Encrypts a file name, zero-padding it to the policy size first.
    pub fn encrypt_name(&self, name: &[u8], max_len: usize) -> Result<Vec<u8>> {
        let cryptlen = self.encrypted_name_len(name.len()).min(max_len);
        let mut padded = vec![0u8; cryptlen];
        padded[..name.len()].copy_from_slice(name);
        cbc_cts_encrypt(&self.enc_key[..32], &padded)
    }

    /// Encrypts a symlink target into its on-flash inline form: the 16-bit
    /// ciphertext length, the ciphertext, and a trailing NUL.
    pub fn encrypt_symlink(&self, target: &[u8]) -> Result<Vec<u8>> {
        let ct = self.encrypt_name(target, UBIFS_MAX_INO_DATA)?;
        let mut out = Vec::with_capacity(SYMLINK_DATA_OVERHEAD + ct.len());
        out.extend_from_slice(&(ct.len() as u16).to_le_bytes());
        out.extend_from_slice(&ct);
        out.push(0);
        Ok(out)
    }

    /// Encrypts one data block with AES-256-XTS, the block number as tweak.
    /// The input is zero-padded to a whole cipher block; the returned length
    /// is the on-flash data length.
    pub fn encrypt_data(&self, block_no: u32, data: &[u8]) -> Result<Vec<u8>> {
        let pad_len = data.len().div_ceil(FS_CRYPTO_BLOCK_SIZE) * FS_CRYPTO_BLOCK_SIZE;
        let mut padded = vec![0u8; pad_len];
        padded[..data.len()].copy_from_slice(data);

        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&(block_no as u64).to_le_bytes());
        evp_encrypt(Cipher::aes_256_xts(), &self.enc_key, Some(&iv), &padded)
    }
}
