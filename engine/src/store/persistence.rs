//! Length-prefixed, versioned persistence file for the metric store.
//!
//! Format: a 4-byte magic, a 1-byte schema version, then a sequence of
//! `bincode`-encoded [`MetricGroup`] records each prefixed with a 4-byte
//! little-endian length, until EOF. Write-out is atomic via write-to-temp +
//! rename, mirroring the sidecar-file pattern this persistence layer is
//! grounded on.

use std::io::Write;
use std::path::Path;

use crate::error::{GatewayError, Result};
use crate::store::MetricGroup;

const MAGIC: &[u8; 4] = b"AMGW";
const SCHEMA_VERSION: u8 = 1;

/// Loads all groups from `path`. A missing file is treated as empty.
pub fn load(path: &Path) -> Result<Vec<MetricGroup>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(GatewayError::PersistenceError(e)),
    };
    decode(&bytes)
}

fn decode(bytes: &[u8]) -> Result<Vec<MetricGroup>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    if bytes.len() < 5 || &bytes[0..4] != MAGIC {
        return Err(GatewayError::PersistenceError(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "persistence file missing AMGW magic header",
        )));
    }
    let version = bytes[4];
    if version > SCHEMA_VERSION {
        return Err(GatewayError::PersistenceError(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported persistence schema version {version}"),
        )));
    }

    let mut cursor = &bytes[5..];
    let mut groups = Vec::new();
    while !cursor.is_empty() {
        if cursor.len() < 4 {
            return Err(GatewayError::PersistenceError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated record length prefix",
            )));
        }
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&cursor[..4]);
        let len = u32::from_le_bytes(len_buf) as usize;
        cursor = &cursor[4..];
        if cursor.len() < len {
            return Err(GatewayError::PersistenceError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated record body",
            )));
        }
        let group: MetricGroup = bincode::deserialize(&cursor[..len])
            .map_err(|e| GatewayError::PersistenceError(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            )))?;
        groups.push(group);
        cursor = &cursor[len..];
    }
    Ok(groups)
}

/// Serializes `groups` and atomically replaces the file at `path`.
pub fn save(path: &Path, groups: &[MetricGroup]) -> Result<()> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    buf.push(SCHEMA_VERSION);
    for group in groups {
        let encoded = bincode::serialize(group).map_err(|e| {
            GatewayError::PersistenceError(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            ))
        })?;
        buf.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        buf.extend_from_slice(&encoded);
    }

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp_path).map_err(GatewayError::PersistenceError)?;
        file.write_all(&buf).map_err(GatewayError::PersistenceError)?;
        file.flush().map_err(GatewayError::PersistenceError)?;
    }
    std::fs::rename(&tmp_path, path).map_err(GatewayError::PersistenceError)?;
    Ok(())
}
