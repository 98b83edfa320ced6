// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Backing-layer entry encoding
//!
//! Layout: one format byte, a little-endian CRC32 of the payload, then the
//! bincode payload. Anything that fails the checksum or does not decode is
//! reported as [`BackingStoreError::Codec`] and the caller drops the key.

use serde::{Deserialize, Serialize};

use crate::error::BackingStoreError;

const FORMAT_V1: u8 = 1;
const HEADER_LEN: usize = 5;

/// Entry as written to the backing layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry<V> {
    pub value: V,
    pub version: u64,
    /// Wall-clock milliseconds since the Unix epoch
    pub stored_at_ms: u64,
    pub ttl_ms: u64,
    pub tags: Vec<String>,
}

impl<V> StoredEntry<V> {
    pub fn expires_at_ms(&self) -> u64 {
        self.stored_at_ms.saturating_add(self.ttl_ms)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms()
    }
}

pub fn encode<V: Serialize>(entry: &StoredEntry<V>) -> Result<Vec<u8>, BackingStoreError> {
    let payload =
        bincode::serialize(entry).map_err(|e| BackingStoreError::Codec(e.to_string()))?;
    let checksum = crc32fast::hash(&payload);

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.push(FORMAT_V1);
    bytes.extend_from_slice(&checksum.to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

pub fn decode<V>(bytes: &[u8]) -> Result<StoredEntry<V>, BackingStoreError>
where
    V: for<'de> Deserialize<'de>,
{
    if bytes.len() < HEADER_LEN {
        return Err(BackingStoreError::Codec(format!(
            "entry too short ({} bytes)",
            bytes.len()
        )));
    }
    if bytes[0] != FORMAT_V1 {
        return Err(BackingStoreError::Codec(format!(
            "unknown format byte {}",
            bytes[0]
        )));
    }

    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&bytes[1..HEADER_LEN]);
    let expected = u32::from_le_bytes(checksum);
    let payload = &bytes[HEADER_LEN..];
    let actual = crc32fast::hash(payload);
    if actual != expected {
        return Err(BackingStoreError::Codec(format!(
            "checksum mismatch (expected {:08x}, got {:08x})",
            expected, actual
        )));
    }

    bincode::deserialize(payload).map_err(|e| BackingStoreError::Codec(e.to_string()))
}
