//! Model artifact validation
//!
//! Cheap header checks run before handing a file to a native runtime.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use thiserror::Error;

/// Magic bytes at the start of every GGUF file
pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";

/// GGUF versions llama.cpp can read
const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u32> = 1..=3;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    NotFound(String),

    #[error("failed to read model file: {0}")]
    Io(#[from] io::Error),

    #[error("not a GGUF file (magic {0:?})")]
    InvalidMagic([u8; 4]),

    #[error("unsupported GGUF version {0}")]
    UnsupportedVersion(u32),

    #[error("truncated GGUF header")]
    Truncated,
}

/// Fields of the fixed-size GGUF header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufMetadata {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
    pub file_size: u64,
}

/// Checks that `path` is a readable GGUF file and returns its header
pub fn validate_gguf(path: impl AsRef<Path>) -> Result<GgufMetadata, ModelError> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(ModelError::NotFound(path.display().to_string()));
    }

    let mut file = File::open(path)?;
    let file_size = file.metadata()?.len();

    let mut header = [0u8; 24];
    file.read_exact(&mut header).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ModelError::Truncated,
        _ => ModelError::Io(e),
    })?;

    let metadata = parse_header(&header, file_size)?;
    tracing::debug!(
        "GGUF v{} header ok: {} tensors, {} metadata keys",
        metadata.version,
        metadata.tensor_count,
        metadata.metadata_kv_count
    );
    Ok(metadata)
}

fn parse_header(header: &[u8; 24], file_size: u64) -> Result<GgufMetadata, ModelError> {
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&header[0..4]);
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    let mut tensor_count = [0u8; 8];
    tensor_count.copy_from_slice(&header[8..16]);
    let mut kv_count = [0u8; 8];
    kv_count.copy_from_slice(&header[16..24]);

    Ok(GgufMetadata {
        version,
        tensor_count: u64::from_le_bytes(tensor_count),
        metadata_kv_count: u64::from_le_bytes(kv_count),
        file_size,
    })
}
