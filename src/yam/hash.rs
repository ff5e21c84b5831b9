// Copyright (c) 2019 Jason White
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A 64-bit content fingerprint.
///
/// The first 8 bytes of a SHA-256 digest, little-endian. Aspect hashes,
/// directory-listing hashes and execution hashes are all of this type.
#[derive(
    Serialize,
    Deserialize,
    Copy,
    Clone,
    Default,
    Ord,
    PartialOrd,
    Eq,
    PartialEq,
    Hash,
)]
pub struct Hash64(u64);

impl Hash64 {
    pub fn from_reader<R>(mut reader: R) -> io::Result<Hash64>
    where
        R: io::Read,
    {
        let mut hasher = Sha256::default();

        const BUF_SIZE: usize = 16384;

        let mut buf = [0u8; BUF_SIZE];

        loop {
            let n = reader.read(&mut buf)?;

            if n == 0 {
                break;
            }

            hasher.input(&buf[0..n]);
        }

        Ok(Self::from_digest(hasher))
    }

    pub fn from_path<P>(path: P) -> io::Result<Hash64>
    where
        P: AsRef<Path>,
    {
        Self::from_reader(fs::File::open(path.as_ref())?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Hash64 {
        let mut hasher = Sha256::default();
        hasher.input(bytes);
        Self::from_digest(hasher)
    }

    pub fn from_str(s: &str) -> Hash64 {
        Self::from_bytes(s.as_bytes())
    }

    /// Combines a sequence of hashes into one.
    pub fn combine<I>(hashes: I) -> Hash64
    where
        I: IntoIterator<Item = Hash64>,
    {
        let mut hasher = Sha256::default();
        for h in hashes {
            hasher.input(&h.0.to_le_bytes());
        }
        Self::from_digest(hasher)
    }

    /// A random hash. Used to seed execution hashes of freshly created nodes
    /// so that the first execution is never skipped.
    pub fn random() -> Hash64 {
        Hash64(rand::random::<u64>())
    }

    fn from_digest(hasher: Sha256) -> Hash64 {
        let digest = hasher.result();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[0..8]);
        Hash64(u64::from_le_bytes(bytes))
    }
}

/// Accumulates values into a single `Hash64`.
#[derive(Default)]
pub struct Hasher64 {
    inner: Sha256,
}

impl Hasher64 {
    pub fn new() -> Hasher64 {
        Hasher64::default()
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.inner.input(bytes);
        self
    }

    pub fn put_str(&mut self, s: &str) -> &mut Self {
        self.inner.input(s.as_bytes());
        self
    }

    pub fn put_hash(&mut self, h: Hash64) -> &mut Self {
        self.inner.input(&(h.0).to_le_bytes());
        self
    }

    pub fn finish(self) -> Hash64 {
        Hash64::from_digest(self.inner)
    }
}

impl fmt::Display for Hash64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.to_le_bytes()))
    }
}

impl fmt::Debug for Hash64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.to_le_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_for_equal_content() {
        assert_eq!(Hash64::from_str("hello"), Hash64::from_str("hello"));
        assert_ne!(Hash64::from_str("hello"), Hash64::from_str("hellp"));
    }

    #[test]
    fn reader_matches_bytes() {
        let data = b"some file content\n";
        let from_reader = Hash64::from_reader(&data[..]).unwrap();
        assert_eq!(from_reader, Hash64::from_bytes(data));
    }

    #[test]
    fn combine_is_order_sensitive() {
        let a = Hash64::from_str("a");
        let b = Hash64::from_str("b");
        assert_ne!(
            Hash64::combine(vec![a, b]),
            Hash64::combine(vec![b, a])
        );
    }

    #[test]
    fn hasher_matches_combine() {
        let a = Hash64::from_str("a");
        let b = Hash64::from_str("b");

        let mut hasher = Hasher64::new();
        hasher.put_hash(a).put_hash(b);

        assert_eq!(hasher.finish(), Hash64::combine(vec![a, b]));
    }
}
