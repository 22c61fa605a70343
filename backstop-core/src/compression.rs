/*!
Stream compression for backup artifacts.

Compression is a small closed set selected once per backup. Each variant
wraps a writer (creation) or a reader (restore) so artifacts are never held
in memory as a whole.
*/

use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::str::FromStr;

use flate2::{read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};

use crate::{BackstopError, Result};

/// Compression applied to an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

/// Compression levels used when writing artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionLevels {
    /// 0-9, flate2 default is 6
    pub gzip: u32,
    /// 1-21, zstd default is 3
    pub zstd: i32,
}

impl Default for CompressionLevels {
    fn default() -> Self {
        Self { gzip: 6, zstd: 3 }
    }
}

impl Compression {
    /// Name of the compression algorithm
    pub fn algorithm_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
        }
    }

    /// Artifact file suffix, appended after the `.db` extension
    pub fn file_suffix(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => ".gz",
            Self::Zstd => ".zst",
        }
    }

    /// Wrap `inner` so that everything written is compressed into it
    pub fn writer<W: Write>(self, inner: W, levels: CompressionLevels) -> Result<CompressingWriter<W>> {
        Ok(match self {
            Self::None => CompressingWriter::Plain(inner),
            Self::Gzip => CompressingWriter::Gzip(GzEncoder::new(
                inner,
                flate2::Compression::new(levels.gzip.min(9)),
            )),
            Self::Zstd => CompressingWriter::Zstd(
                zstd::Encoder::new(inner, levels.zstd).map_err(|e| {
                    BackstopError::compression(format!("Failed to start zstd encoder: {e}"))
                })?,
            ),
        })
    }

    /// Wrap `inner` so that reads yield decompressed bytes
    pub fn reader<'a, R: Read + 'a>(self, inner: R) -> Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Self::None => Box::new(inner),
            Self::Gzip => Box::new(GzDecoder::new(inner)),
            Self::Zstd => Box::new(zstd::Decoder::with_buffer(BufReader::new(inner)).map_err(
                |e| BackstopError::compression(format!("Failed to start zstd decoder: {e}")),
            )?),
        })
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.algorithm_name())
    }
}

impl FromStr for Compression {
    type Err = BackstopError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "gzip" | "gz" => Ok(Self::Gzip),
            "zstd" | "zst" => Ok(Self::Zstd),
            other => Err(BackstopError::validation(format!(
                "unknown compression '{other}' (expected none, gzip or zstd)"
            ))),
        }
    }
}

/// Writer half of a [`Compression`] variant.
///
/// `finish` must be called to flush trailers; dropping without finishing
/// leaves a truncated stream, which is only acceptable on error paths where
/// the destination is discarded anyway.
pub enum CompressingWriter<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
    Zstd(zstd::Encoder<'static, W>),
}

impl<W: Write> CompressingWriter<W> {
    /// Complete the stream and hand back the inner writer
    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::Plain(mut w) => {
                w.flush()?;
                Ok(w)
            }
            Self::Gzip(encoder) => encoder.finish(),
            Self::Zstd(encoder) => encoder.finish(),
        }
    }
}

impl<W: Write> Write for CompressingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Gzip(w) => w.write(buf),
            Self::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Gzip(w) => w.flush(),
            Self::Zstd(w) => w.flush(),
        }
    }
}
