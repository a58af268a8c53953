//! UBIFS compound keys.
//!
//! A key is 64 bits: the low word is the inode number, the high word packs a
//! 3-bit type together with a 29-bit payload (a name hash for directory and
//! xattr entries, a block number for data nodes).  Keys order the index; the
//! derived ordering on `(inum, aux)` matches the on-flash comparison.

use crate::format::{UBIFS_MAX_KEY_LEN, UBIFS_SK_LEN};

pub const UBIFS_S_KEY_BLOCK_BITS: u32 = 29;
pub const UBIFS_S_KEY_BLOCK_MASK: u32 = 0x1FFFFFFF;
pub const UBIFS_S_KEY_HASH_BITS: u32 = 29;
pub const UBIFS_S_KEY_HASH_MASK: u32 = 0x1FFFFFFF;

/// Key types, stored in the top three bits of the key's high word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum KeyType {
    Ino = 0,
    Data = 1,
    Dent = 2,
    Xent = 3,
}

/// The name hash function selected for the image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameHash {
    R5,
    Test,
}

/// Hashes ≤ 2 are reserved for special dentries, so real hashes are bumped
/// past them.
fn mask_hash(hash: u32) -> u32 {
    let hash = hash & UBIFS_S_KEY_HASH_MASK;
    if hash <= 2 {
        hash + 3
    } else {
        hash
    }
}

impl NameHash {
    pub fn hash(self, name: &[u8]) -> u32 {
        match self {
            NameHash::R5 => {
                // The reference implementation runs over *signed* chars; the
                // shifts below must sign-extend to reproduce its values.
                let mut a = 0u32;
                for &byte in name {
                    let c = byte as i8 as i32;
                    a = a
                        .wrapping_add((c << 4) as u32)
                        .wrapping_add((c >> 4) as u32)
                        .wrapping_mul(11);
                }
                mask_hash(a)
            }
            NameHash::Test => {
                let mut word = [0u8; 4];
                let n = name.len().min(4);
                word[..n].copy_from_slice(&name[..n]);
                mask_hash(u32::from_le_bytes(word))
            }
        }
    }
}

/// A 64-bit UBIFS key.  The field order gives the on-flash comparison for
/// free via the derived `Ord`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Key {
    pub inum: u32,
    pub aux: u32,
}

impl Key {
    pub fn ino(inum: u64) -> Key {
        Key {
            inum: inum as u32,
            aux: (KeyType::Ino as u32) << UBIFS_S_KEY_HASH_BITS,
        }
    }

    pub fn data(inum: u64, block: u32) -> Key {
        Key {
            inum: inum as u32,
            aux: ((KeyType::Data as u32) << UBIFS_S_KEY_BLOCK_BITS) | (block & UBIFS_S_KEY_BLOCK_MASK),
        }
    }

    pub fn dent(dir_inum: u64, hash: NameHash, name: &[u8]) -> Key {
        Key {
            inum: dir_inum as u32,
            aux: ((KeyType::Dent as u32) << UBIFS_S_KEY_HASH_BITS) | hash.hash(name),
        }
    }

    pub fn xent(host_inum: u64, hash: NameHash, name: &[u8]) -> Key {
        Key {
            inum: host_inum as u32,
            aux: ((KeyType::Xent as u32) << UBIFS_S_KEY_HASH_BITS) | hash.hash(name),
        }
    }

    /// The key as stored in node key fields: the simple key in the first
    /// eight bytes, zero-padded to the full key area.
    pub fn to_node_bytes(self) -> [u8; UBIFS_MAX_KEY_LEN] {
        let mut out = [0u8; UBIFS_MAX_KEY_LEN];
        out[0..4].copy_from_slice(&self.inum.to_le_bytes());
        out[4..8].copy_from_slice(&self.aux.to_le_bytes());
        out
    }

    /// The key as stored in index branches: just the simple key.
    pub fn to_idx_bytes(self) -> [u8; UBIFS_SK_LEN] {
        let mut out = [0u8; UBIFS_SK_LEN];
        out[0..4].copy_from_slice(&self.inum.to_le_bytes());
        out[4..8].copy_from_slice(&self.aux.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_r5_hash() {
        // ((97 << 4) + (97 >> 4)) * 11
        assert_eq!(NameHash::R5.hash(b"a"), 17138);
        // High-bit bytes exercise the signed-char semantics.
        assert_eq!(NameHash::R5.hash(&[0xFF]), 0x1FFFFF45);
        // The empty name hashes to 0, which is clamped to 3.
        assert_eq!(NameHash::R5.hash(b""), 3);
    }

    #[test]
    fn test_test_hash() {
        assert_eq!(NameHash::Test.hash(b"abcd"), 0x64636261 & UBIFS_S_KEY_HASH_MASK);
        assert_eq!(NameHash::Test.hash(b"abcdefgh"), 0x64636261 & UBIFS_S_KEY_HASH_MASK);
        assert_eq!(NameHash::Test.hash(b"a"), 0x61);
        assert_eq!(NameHash::Test.hash(b""), 3);
    }

    #[test]
    fn test_key_ordering() {
        let root_ino = Key::ino(1);
        let root_dent = Key::dent(1, NameHash::R5, b"hello");
        let file_ino = Key::ino(65);
        let file_data0 = Key::data(65, 0);
        let file_data1 = Key::data(65, 1);

        // Within an inode: inode key, then data keys, then dentry keys.
        assert!(root_ino < root_dent);
        assert!(file_ino < file_data0);
        assert!(file_data0 < file_data1);
        // All keys of a lower inode sort before any key of a higher one.
        assert!(root_dent < file_ino);
    }

    #[test]
    fn test_key_serialization() {
        let key = Key::data(65, 3);
        let node = key.to_node_bytes();
        assert_eq!(&node[0..4], &65u32.to_le_bytes());
        assert_eq!(&node[4..8], &((1u32 << 29) | 3).to_le_bytes());
        assert_eq!(&node[8..], &[0; 8]);
        assert_eq!(&key.to_idx_bytes()[..], &node[..8]);
    }
}
