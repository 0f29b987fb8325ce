//! Content digests for end-to-end transfer verification

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Working buffer for streaming digests (BUFSIZ)
const DIGEST_BUF_SIZE: usize = 8192;

/// Available digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Md5,
    Blake3,
}

impl Default for DigestAlgorithm {
    fn default() -> Self {
        Self::Md5
    }
}

impl DigestAlgorithm {
    pub fn len(self) -> usize {
        match self {
            DigestAlgorithm::Md5 => 16,
            DigestAlgorithm::Blake3 => 32,
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestAlgorithm::Md5 => f.write_str("md5"),
            DigestAlgorithm::Blake3 => f.write_str("blake3"),
        }
    }
}

/// Fixed-length fingerprint of a byte stream
#[derive(Clone)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    bytes: Vec<u8>,
}

impl Digest {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}

impl PartialEq for Digest {
    fn eq(&self, other: &Self) -> bool {
        equal(self, other)
    }
}

impl Eq for Digest {}

enum Hasher {
    Md5(md5::Context),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Md5 => Hasher::Md5(md5::Context::new()),
            DigestAlgorithm::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(ctx) => ctx.consume(data),
            Hasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    fn finish(self) -> Digest {
        match self {
            Hasher::Md5(ctx) => Digest {
                algorithm: DigestAlgorithm::Md5,
                bytes: ctx.compute().0.to_vec(),
            },
            Hasher::Blake3(h) => Digest {
                algorithm: DigestAlgorithm::Blake3,
                bytes: h.finalize().as_bytes().to_vec(),
            },
        }
    }
}

/// Digest a stream in a single pass with a fixed working buffer
pub fn digest<R: Read>(mut reader: R, algorithm: DigestAlgorithm) -> io::Result<Digest> {
    let mut hasher = Hasher::new(algorithm);
    let mut buf = [0u8; DIGEST_BUF_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
}

pub fn digest_file(path: &Path, algorithm: DigestAlgorithm) -> io::Result<Digest> {
    digest(File::open(path)?, algorithm)
}

/// True iff both digests use the same algorithm and every byte matches
pub fn equal(a: &Digest, b: &Digest) -> bool {
    a.algorithm == b.algorithm
        && a.bytes.len() == a.algorithm.len()
        && a.bytes.len() == b.bytes.len()
        && a.bytes.iter().zip(b.bytes.iter()).all(|(x, y)| x == y)
}
