//! The authentication capability: node hashes and superblock signing.
//!
//! On authenticated images every index branch carries the hash of its child
//! node, the master node records the root index and LPT hashes, the
//! superblock records the master node hash, and a PKCS#7 detached signature
//! of the superblock is appended as a signature node.

use std::path::Path;

use openssl::{
    hash::MessageDigest,
    pkcs7::{Pkcs7, Pkcs7Flags},
    pkey::{PKey, Private},
    stack::Stack,
    x509::X509,
};

use crate::error::{Error, Result};

/// The hash algorithms an image may be authenticated with.  The on-flash
/// code follows the kernel's hash_info numbering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgo {
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgo {
    pub fn from_name(name: &str) -> Option<HashAlgo> {
        match name {
            "sha1" => Some(HashAlgo::Sha1),
            "sha256" => Some(HashAlgo::Sha256),
            "sha512" => Some(HashAlgo::Sha512),
            _ => None,
        }
    }

    /// The algorithm identifier stored in the superblock.
    pub fn on_flash_code(self) -> u16 {
        match self {
            HashAlgo::Sha1 => 2,
            HashAlgo::Sha256 => 4,
            HashAlgo::Sha512 => 6,
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashAlgo::Sha1 => 20,
            HashAlgo::Sha256 => 32,
            HashAlgo::Sha512 => 64,
        }
    }

    fn message_digest(self) -> MessageDigest {
        match self {
            HashAlgo::Sha1 => MessageDigest::sha1(),
            HashAlgo::Sha256 => MessageDigest::sha256(),
            HashAlgo::Sha512 => MessageDigest::sha512(),
        }
    }
}

fn signing_err(e: openssl::error::ErrorStack) -> Error {
    Error::SigningFailed(e.to_string())
}

/// Holds the signing material for an authenticated image.
pub struct Authenticator {
    algo: HashAlgo,
    key: PKey<Private>,
    cert: X509,
}

impl Authenticator {
    pub fn new(algo: HashAlgo, key_file: &Path, cert_file: &Path) -> Result<Authenticator> {
        let key_pem = std::fs::read(key_file).map_err(|e| Error::source_io(key_file, e))?;
        let key = PKey::private_key_from_pem(&key_pem).map_err(signing_err)?;
        let cert_pem = std::fs::read(cert_file).map_err(|e| Error::source_io(cert_file, e))?;
        let cert = X509::from_pem(&cert_pem).map_err(signing_err)?;
        Ok(Authenticator { algo, key, cert })
    }

    /// Builds an authenticator from already-loaded material.
    pub fn from_parts(algo: HashAlgo, key: PKey<Private>, cert: X509) -> Authenticator {
        Authenticator { algo, key, cert }
    }

    pub fn algo(&self) -> HashAlgo {
        self.algo
    }

    pub fn hash_len(&self) -> usize {
        self.algo.digest_len()
    }

    /// Hashes a prepared node into the first `hash_len()` bytes of `out`.
    pub fn node_hash(&self, node: &[u8], out: &mut [u8]) -> Result<()> {
        let digest =
            openssl::hash::hash(self.algo.message_digest(), node).map_err(signing_err)?;
        out[..digest.len()].copy_from_slice(&digest);
        Ok(())
    }

    /// Produces the detached PKCS#7 signature of the prepared superblock
    /// node, in DER form, for the trailing signature node.
    pub fn sign_superblock(&self, sb: &[u8]) -> Result<Vec<u8>> {
        let certs = Stack::new().map_err(signing_err)?;
        let flags = Pkcs7Flags::DETACHED | Pkcs7Flags::BINARY | Pkcs7Flags::NOATTR;
        let pkcs7 =
            Pkcs7::sign(&self.cert, &self.key, &certs, sb, flags).map_err(signing_err)?;
        pkcs7.to_der().map_err(signing_err)
    }
}
