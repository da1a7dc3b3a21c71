//! Model file loading
//!
//! Plain models are handed to the engine by path. Encrypted models are read
//! whole and decoded in memory with a repeating-key XOR before the engine
//! sees them.
//!
//! The XOR key is a constant compiled into the binary. It hides model bytes
//! from casual inspection and nothing more: anyone holding the binary can
//! recover the key, so treat `.enc` files as obfuscated, not protected.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Embedded XOR key for encrypted model files
pub const MODEL_KEY: &[u8] = b"3!4%@Us287uEUo86^QSA%L";

/// Model bytes as handed to the engine
pub enum ModelSource {
    /// Plain model, loaded by the engine from disk
    File(PathBuf),
    /// Decoded model bytes, wiped on drop
    Memory(Zeroizing<Vec<u8>>),
}

impl ModelSource {
    /// In-memory model bytes, if any
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::File(_) => None,
            Self::Memory(bytes) => Some(bytes.as_slice()),
        }
    }

    /// Model path, if file backed
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            Self::Memory(_) => None,
        }
    }
}

impl fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Memory(bytes) => write!(f, "Memory({} bytes)", bytes.len()),
        }
    }
}

/// XOR `data` in place with `key`, cycling the key
///
/// Self-inverse: applying it twice with the same key restores the input.
/// An empty key leaves the data untouched.
pub fn xor_cipher(data: &mut [u8], key: &[u8]) {
    if key.is_empty() {
        return;
    }
    for (byte, k) in data.iter_mut().zip(key.iter().cycle()) {
        *byte ^= k;
    }
}

/// Load a model for the engine
///
/// Plain files are checked for existence and returned by path. Encrypted
/// files are read fully and decoded with [`MODEL_KEY`].
pub fn load(path: &Path, encrypted: bool) -> Result<ModelSource> {
    let metadata = fs::metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::ModelNotFound {
            path: path.to_path_buf(),
        },
        _ => Error::Io(e),
    })?;

    if !metadata.is_file() {
        return Err(Error::ModelNotFound {
            path: path.to_path_buf(),
        });
    }
    if metadata.len() == 0 {
        return Err(Error::EmptyModel {
            path: path.to_path_buf(),
        });
    }

    if !encrypted {
        debug!(path = %path.display(), size = metadata.len(), "Using file-backed model");
        return Ok(ModelSource::File(path.to_path_buf()));
    }

    let mut bytes = Zeroizing::new(fs::read(path)?);
    if bytes.is_empty() {
        return Err(Error::EmptyModel {
            path: path.to_path_buf(),
        });
    }
    xor_cipher(&mut bytes, MODEL_KEY);

    debug!(path = %path.display(), size = bytes.len(), "Decoded encrypted model");
    Ok(ModelSource::Memory(bytes))
}

/// Write an encrypted copy of a plain model file
///
/// Produces the `.enc` form read by [`load`] with `encrypted = true`.
pub fn encrypt_file(src: &Path, dst: &Path) -> Result<()> {
    let mut bytes = Zeroizing::new(fs::read(src).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::ModelNotFound {
            path: src.to_path_buf(),
        },
        _ => Error::Io(e),
    })?);
    if bytes.is_empty() {
        return Err(Error::EmptyModel {
            path: src.to_path_buf(),
        });
    }
    xor_cipher(&mut bytes, MODEL_KEY);
    fs::write(dst, bytes.as_slice())?;
    Ok(())
}
