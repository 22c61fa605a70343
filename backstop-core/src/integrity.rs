/*!
SHA-256 integrity helpers.

Checksums always cover the stored artifact bytes (post-compression), so the
hashing adapters sit between the compressor and the file on write, and
between the file and the decompressor on restore.
*/

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

const READ_BUFFER: usize = 64 * 1024;

/// Compute the hex SHA-256 of an in-memory buffer
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Stream a file through SHA-256, returning `(hex digest, byte count)`
pub fn hash_file(path: &Path) -> io::Result<(String, u64)> {
    let mut reader = HashingReader::new(BufReader::with_capacity(READ_BUFFER, File::open(path)?));
    io::copy(&mut reader, &mut io::sink())?;
    Ok(reader.finalize())
}

/// Writer adapter that hashes and counts everything passed to the inner writer
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Consume the adapter, returning the inner writer, hex digest and byte count
    pub fn finalize(self) -> (W, String, u64) {
        (self.inner, format!("{:x}", self.hasher.finalize()), self.bytes)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader adapter that hashes and counts every byte read through it
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Hex digest and byte count of everything read so far
    pub fn finalize(self) -> (String, u64) {
        (format!("{:x}", self.hasher.finalize()), self.bytes)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}
