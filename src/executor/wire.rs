// src/executor/wire.rs

//! Framing for the files exchanged with a forked child.
//!
//! ```text
//! magic "TLWF" | version u16 BE | kind u8 | length u32 BE | JSON payload
//! ```
//!
//! Files are written to a temporary sibling and renamed into place, so a
//! reader never sees a half-written frame.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::decrypter::CredentialAccess;
use crate::task::TaskContext;

const MAGIC: &[u8; 4] = b"TLWF";
const VERSION: u16 = 1;
const MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("not a task exchange file")]
    BadMagic,

    #[error("unsupported exchange format version {0}")]
    UnsupportedVersion(u16),

    #[error("expected a {expected:?} frame, found kind {found}")]
    UnexpectedKind { expected: FrameKind, found: u8 },

    #[error("frame payload of {0} bytes exceeds the limit")]
    TooLarge(u64),

    #[error("payload encoding: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Context = 1,
    Result = 2,
}

/// What the launcher hands a forked child. Credentials are decrypted by the
/// launcher; the private key never crosses the process boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkRequest {
    pub context: TaskContext,
    #[serde(default)]
    pub credentials: CredentialAccess,
}

pub fn write_frame<W: Write, T: Serialize>(
    mut writer: W,
    kind: FrameKind,
    value: &T,
) -> Result<(), WireError> {
    let payload = serde_json::to_vec(value)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_PAYLOAD)
        .ok_or(WireError::TooLarge(payload.len() as u64))?;

    writer.write_all(MAGIC)?;
    writer.write_all(&VERSION.to_be_bytes())?;
    writer.write_all(&[kind as u8])?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<R: Read, T: DeserializeOwned>(
    mut reader: R,
    expected: FrameKind,
) -> Result<T, WireError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(WireError::BadMagic);
    }

    let mut version = [0u8; 2];
    reader.read_exact(&mut version)?;
    let version = u16::from_be_bytes(version);
    if version != VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }

    let mut kind = [0u8; 1];
    reader.read_exact(&mut kind)?;
    if kind[0] != expected as u8 {
        return Err(WireError::UnexpectedKind {
            expected,
            found: kind[0],
        });
    }

    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len);
    if len > MAX_PAYLOAD {
        return Err(WireError::TooLarge(u64::from(len)));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(serde_json::from_slice(&payload)?)
}

pub fn write_frame_file<T: Serialize>(
    path: &Path,
    kind: FrameKind,
    value: &T,
) -> Result<(), WireError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = NamedTempFile::new_in(dir)?;
    write_frame(BufWriter::new(tmp.as_file()), kind, value)?;
    tmp.persist(path).map_err(|e| WireError::Io(e.error))?;
    Ok(())
}

pub fn read_frame_file<T: DeserializeOwned>(
    path: &Path,
    expected: FrameKind,
) -> Result<T, WireError> {
    read_frame(BufReader::new(File::open(path)?), expected)
}
