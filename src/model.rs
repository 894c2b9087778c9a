//! Model file pre-validation
//!
//! Cheap header probe run before a model path is handed to the backend, so a
//! truncated or mislabeled file fails fast with a readable reason instead of
//! deep inside the native loader.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use thiserror::Error;

/// GGUF magic, little-endian "GGUF".
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// Header size: magic + version + tensor count + metadata kv count.
const HEADER_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum ModelFileError {
    #[error("failed to open model file: {0}")]
    Open(#[from] std::io::Error),

    #[error("file too small to hold a model header")]
    TooSmall,

    #[error("not a GGUF file (magic 0x{0:08X})")]
    BadMagic(u32),

    #[error("unsupported GGUF version {0}")]
    UnsupportedVersion(u32),
}

/// Header fields of a GGUF model file.
#[derive(Debug, Clone, Copy)]
pub struct ModelHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

/// Reads and checks the GGUF header. Accepts versions 2 and 3.
pub fn probe_model_file<P: AsRef<Path>>(path: P) -> Result<ModelHeader, ModelFileError> {
    let mut file = File::open(path.as_ref())?;

    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            ModelFileError::TooSmall
        } else {
            ModelFileError::Open(e)
        }
    })?;

    let word = |i: usize| u32::from_le_bytes(header[i..i + 4].try_into().unwrap());
    let quad = |i: usize| u64::from_le_bytes(header[i..i + 8].try_into().unwrap());

    let magic = word(0);
    if magic != GGUF_MAGIC {
        return Err(ModelFileError::BadMagic(magic));
    }
    let version = word(4);
    if !(2..=3).contains(&version) {
        return Err(ModelFileError::UnsupportedVersion(version));
    }

    Ok(ModelHeader {
        version,
        tensor_count: quad(8),
        metadata_kv_count: quad(16),
    })
}
