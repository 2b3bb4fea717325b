//! Content checksums with Perforce's digest quirks.
//!
//! Perforce stores an uppercase MD5 of the *canonical* file content, which
//! is not always the on-disk bytes: utf16 files are digested as their UTF-8
//! re-encoding, and utf8 files are digested without the byte-order mark the
//! client may have written locally.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::str::FromStr;

use md5::{Digest, Md5};
use thiserror::Error;

const CHUNK: usize = 1024 * 1024;
const UTF8_BOM: [u8; 3] = [0xef, 0xbb, 0xbf];

/// Content flavor, carried as the `/suffix` of a record's size column.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Flavor {
    #[default]
    Plain,
    Utf8,
    Utf16,
    Symlink,
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => Ok(()),
            Self::Utf8 => write!(f, "/utf8"),
            Self::Utf16 => write!(f, "/utf16"),
            Self::Symlink => write!(f, "/symlink"),
        }
    }
}

/// A declared file size: byte count plus content flavor, e.g. `1234/utf8`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SizeSpec {
    pub bytes: u64,
    pub flavor: Flavor,
}

#[derive(Debug, Error)]
#[error("invalid size spec `{0}`")]
pub struct SizeSpecError(String);

impl FromStr for SizeSpec {
    type Err = SizeSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (num, flavor) = match s.split_once('/') {
            Some((num, "utf8")) => (num, Flavor::Utf8),
            Some((num, "utf16")) => (num, Flavor::Utf16),
            Some((num, "symlink")) => (num, Flavor::Symlink),
            Some(_) => return Err(SizeSpecError(s.to_owned())),
            None => (s, Flavor::Plain),
        };
        let bytes = num.parse().map_err(|_| SizeSpecError(s.to_owned()))?;
        Ok(Self { bytes, flavor })
    }
}

impl fmt::Display for SizeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.bytes, self.flavor)
    }
}

impl SizeSpec {
    pub const fn new(bytes: u64, flavor: Flavor) -> Self {
        Self { bytes, flavor }
    }
}

/// Digest the file at `path` according to `spec`, as uppercase MD5 hex.
///
/// Returns `Ok(None)` when there is nothing to digest: the file is missing,
/// it is a directory, or the spec names a symlink (symlinks always count as
/// matching and are never content-checked).
pub fn checksum(path: &Path, spec: &SizeSpec) -> io::Result<Option<String>> {
    if spec.flavor == Flavor::Symlink {
        return Ok(None);
    }
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let meta = file.metadata()?;
    if meta.is_dir() {
        return Ok(None);
    }

    let mut hasher = Md5::new();
    match spec.flavor {
        Flavor::Utf16 => {
            let mut raw = Vec::with_capacity(meta.len() as usize);
            file.read_to_end(&mut raw)?;
            hasher.update(decode_utf16_to_utf8(&raw)?);
        }
        Flavor::Utf8 => {
            // The server digest excludes the BOM; a local BOM is betrayed by
            // the on-disk size exceeding the declared size.
            if meta.len() > spec.bytes {
                let mut bom = [0u8; 3];
                let n = file.read(&mut bom)?;
                if n < 3 || bom != UTF8_BOM {
                    file.seek(SeekFrom::Start(0))?;
                }
            }
            hash_stream(&mut file, &mut hasher)?;
        }
        Flavor::Plain => hash_stream(&mut file, &mut hasher)?,
        Flavor::Symlink => unreachable!(),
    }
    Ok(Some(to_upper_hex(&hasher.finalize())))
}

fn hash_stream(file: &mut File, hasher: &mut Md5) -> io::Result<()> {
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        hasher.update(&buf[..n]);
    }
}

/// Decode UTF-16 (BOM-aware, little-endian default) and re-encode as UTF-8.
fn decode_utf16_to_utf8(raw: &[u8]) -> io::Result<Vec<u8>> {
    let (body, big_endian) = match raw {
        [0xff, 0xfe, rest @ ..] => (rest, false),
        [0xfe, 0xff, rest @ ..] => (rest, true),
        rest => (rest, false),
    };
    if body.len() % 2 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "odd byte count in utf16 file",
        ));
    }
    let units = body.chunks_exact(2).map(|pair| {
        if big_endian {
            u16::from_be_bytes([pair[0], pair[1]])
        } else {
            u16::from_le_bytes([pair[0], pair[1]])
        }
    });
    let decoded: Result<String, _> = char::decode_utf16(units).collect();
    decoded
        .map(String::into_bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn to_upper_hex(digest: &[u8]) -> String {
    use fmt::Write as _;
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        // Writing to a String cannot fail.
        let _ = write!(out, "{byte:02X}");
    }
    out
}
