//! Streaming content checksums.
//!
//! Checksums are rendered as `<algorithm>:<lowercase hex>` so a catalog
//! written with one algorithm is never mistaken for another.

use md5::Context as Md5Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Read buffer used when hashing files (64KB)
const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Md5,
}

impl ChecksumAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Md5 => "md5",
        }
    }

    pub fn hasher(&self) -> ChecksumHasher {
        match self {
            ChecksumAlgorithm::Sha256 => ChecksumHasher::Sha256(Sha256::new()),
            ChecksumAlgorithm::Md5 => ChecksumHasher::Md5(Md5Context::new()),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Incremental hasher for one of the supported algorithms.
pub enum ChecksumHasher {
    Sha256(Sha256),
    Md5(Md5Context),
}

impl ChecksumHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            ChecksumHasher::Sha256(h) => h.update(data),
            ChecksumHasher::Md5(h) => h.consume(data),
        }
    }

    pub fn finalize(self) -> String {
        match self {
            ChecksumHasher::Sha256(h) => format!("sha256:{:x}", h.finalize()),
            ChecksumHasher::Md5(h) => format!("md5:{:x}", h.compute()),
        }
    }
}

/// Hash a file without loading it into memory.
///
/// Returns the checksum and the number of bytes read. Blocking; call from
/// `spawn_blocking` inside the runtime.
pub fn checksum_file(path: &Path, algorithm: ChecksumAlgorithm) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..read]);
        total += read as u64;
    }

    Ok((hasher.finalize(), total))
}
