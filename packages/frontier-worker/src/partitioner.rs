//! Deterministic key → partition mapping.
//!
//! Independent crawler instances decide which partition owns a domain or a
//! fingerprint without talking to each other, so both mappings here must be
//! pure functions of the key and the partition count: no seeds, no process
//! state, no platform-dependent hashing.

use thiserror::Error;

/// Offsets of the hex character pairs sampled by [`FingerprintPartitioner`].
const FINGERPRINT_SLICES: [usize; 4] = [0, 5, 10, 15];

/// Minimum fingerprint length covering every sampled pair.
const MIN_FINGERPRINT_LEN: usize = 17;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("topic has no partitions")]
    NoPartitions,

    #[error("fingerprint too short: {len} chars, need at least {MIN_FINGERPRINT_LEN}")]
    FingerprintTooShort { len: usize },

    #[error("fingerprint is not hex: {0}")]
    InvalidFingerprint(String),
}

/// Maps a key to a partition index in `[0, partition_count)`.
pub trait Partitioner: Send + Sync {
    fn partition(&self, key: &[u8], partition_count: u32) -> Result<u32, PartitionError>;
}

/// CRC32 over the key bytes, modulo the partition count.
///
/// The checksum is taken as an unsigned `u32`. Used for outgoing batches,
/// keyed by domain name.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32NamePartitioner;

impl Crc32NamePartitioner {
    pub fn new() -> Self {
        Self
    }

    pub fn partition_by_hash(value: u32, partition_count: u32) -> Result<u32, PartitionError> {
        if partition_count == 0 {
            return Err(PartitionError::NoPartitions);
        }
        Ok(value % partition_count)
    }
}

impl Partitioner for Crc32NamePartitioner {
    fn partition(&self, key: &[u8], partition_count: u32) -> Result<u32, PartitionError> {
        Self::partition_by_hash(crc32fast::hash(key), partition_count)
    }
}

/// Partitions by four byte pairs sampled from a hex fingerprint.
///
/// Characters `[0..2]`, `[5..7]`, `[10..12]` and `[15..17]` are concatenated,
/// hex-decoded into four bytes and read as a little-endian `u32`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FingerprintPartitioner;

impl FingerprintPartitioner {
    pub fn new() -> Self {
        Self
    }

    fn sample(key: &[u8]) -> Result<u32, PartitionError> {
        if key.len() < MIN_FINGERPRINT_LEN {
            return Err(PartitionError::FingerprintTooShort { len: key.len() });
        }

        let mut sampled = [0u8; 8];
        for (i, start) in FINGERPRINT_SLICES.iter().enumerate() {
            sampled[i * 2..i * 2 + 2].copy_from_slice(&key[*start..*start + 2]);
        }

        let mut digest = [0u8; 4];
        hex::decode_to_slice(sampled, &mut digest).map_err(|_| {
            PartitionError::InvalidFingerprint(String::from_utf8_lossy(key).into_owned())
        })?;
        Ok(u32::from_le_bytes(digest))
    }
}

impl Partitioner for FingerprintPartitioner {
    fn partition(&self, key: &[u8], partition_count: u32) -> Result<u32, PartitionError> {
        if partition_count == 0 {
            return Err(PartitionError::NoPartitions);
        }
        Ok(Self::sample(key)? % partition_count)
    }
}
