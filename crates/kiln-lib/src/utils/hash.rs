use anyhow::{Context, Result};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::io::Read;
use std::path::Path;

const BUF_SIZE: usize = 64 * 1024;

/// Digest algorithms the engine verifies against. CurseForge metadata carries
/// SHA-1, Modrinth carries SHA-512; the content cache keys on SHA-256.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgo {
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgo::Sha1 => "sha1",
            HashAlgo::Sha256 => "sha256",
            HashAlgo::Sha512 => "sha512",
        }
    }
}

/// An expected digest together with its algorithm, so SHA-1 and SHA-512
/// values from different manifest sources are never cross-compared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedHash {
    pub algo: HashAlgo,
    pub hex: String,
}

impl ExpectedHash {
    pub fn new(algo: HashAlgo, hex: impl Into<String>) -> Self {
        Self {
            algo,
            hex: hex.into().to_lowercase(),
        }
    }

    pub fn sha1(hex: impl Into<String>) -> Self {
        Self::new(HashAlgo::Sha1, hex)
    }

    pub fn sha512(hex: impl Into<String>) -> Self {
        Self::new(HashAlgo::Sha512, hex)
    }

    pub fn matches(&self, computed_hex: &str) -> bool {
        self.hex == computed_hex.to_lowercase()
    }
}

enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

/// Incremental hasher over one of the supported algorithms. Keeps download
/// verification single-pass: feed chunks as they arrive, finalize at the end.
pub struct StreamingHasher {
    inner: Hasher,
}

impl StreamingHasher {
    pub fn new(algo: HashAlgo) -> Self {
        let inner = match algo {
            HashAlgo::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgo::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlgo::Sha512 => Hasher::Sha512(Sha512::new()),
        };
        Self { inner }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match &mut self.inner {
            Hasher::Sha1(h) => h.update(bytes),
            Hasher::Sha256(h) => h.update(bytes),
            Hasher::Sha512(h) => h.update(bytes),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self.inner {
            Hasher::Sha1(h) => format!("{:x}", h.finalize()),
            Hasher::Sha256(h) => format!("{:x}", h.finalize()),
            Hasher::Sha512(h) => format!("{:x}", h.finalize()),
        }
    }
}

/// Hash a reader without loading it whole into memory.
pub fn hash_reader<R: Read>(mut reader: R, algo: HashAlgo) -> Result<String> {
    let mut hasher = StreamingHasher::new(algo);
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let read = reader.read(&mut buf).context("read while hashing")?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize_hex())
}

pub fn hash_bytes(bytes: &[u8], algo: HashAlgo) -> String {
    let mut hasher = StreamingHasher::new(algo);
    hasher.update(bytes);
    hasher.finalize_hex()
}

pub fn hash_file(path: &Path, algo: HashAlgo) -> Result<String> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("open file for hashing: {:?}", path))?;
    hash_reader(std::io::BufReader::new(file), algo)
        .with_context(|| format!("hash file {:?}", path))
}

/// Verify a file against an expected digest; returns the computed hex on
/// mismatch so callers can report both sides.
pub fn verify_file(path: &Path, expected: &ExpectedHash) -> Result<std::result::Result<(), String>> {
    let computed = hash_file(path, expected.algo)?;
    if expected.matches(&computed) {
        Ok(Ok(()))
    } else {
        Ok(Err(computed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn known_sha1_vector() {
        // sha1("abc")
        assert_eq!(
            hash_bytes(b"abc", HashAlgo::Sha1),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn known_sha256_vector() {
        assert_eq!(
            hash_bytes(b"abc", HashAlgo::Sha256),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn reader_and_bytes_agree() {
        let data = vec![7u8; 300_000];
        let from_bytes = hash_bytes(&data, HashAlgo::Sha512);
        let from_reader = hash_reader(&data[..], HashAlgo::Sha512).unwrap();
        assert_eq!(from_bytes, from_reader);
    }

    #[test]
    fn expected_hash_is_case_insensitive() {
        let expected = ExpectedHash::sha1("A9993E364706816ABA3E25717850C26C9CD0D89D");
        assert!(expected.matches("a9993e364706816aba3e25717850c26c9cd0d89d"));
    }

    #[test]
    fn verify_file_reports_mismatch() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"hello").unwrap();
        let expected = ExpectedHash::sha1("0000000000000000000000000000000000000000");
        let outcome = verify_file(f.path(), &expected).unwrap();
        assert!(outcome.is_err());
    }
}
