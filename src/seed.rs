//! `o4 seed-from`: fill the workspace from a local seed directory.
//!
//! For each incoming record, copy (or move) the seed's file into place when
//! its content already matches what Perforce would send — by the seed's own
//! fstat file when one is supplied, by checksumming otherwise. Records that
//! could not be satisfied locally pass through to the next stage, which
//! fetches them from the server.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use o4_fstat::cache;
use o4_fstat::record::{Line, PassKind, decode_line, passthrough};
use tracing::debug;

#[derive(Clone, Debug)]
pub struct SeedOptions {
    pub dir: PathBuf,
    /// The seed's own fstat cache file, when trustworthy (no files open for
    /// edit under the seed).
    pub fstat: Option<PathBuf>,
    /// Move files out of the seed instead of copying.
    pub move_files: bool,
}

pub fn run(opts: &SeedOptions, input: &mut dyn BufRead, out: &mut dyn Write) -> Result<()> {
    let seed_checksums: Option<HashMap<String, String>> = match &opts.fstat {
        Some(path) => {
            let mut map = HashMap::new();
            for record in cache::read_records(path)? {
                let record = record?;
                map.insert(record.path.clone(), record.checksum);
            }
            Some(map)
        }
        None => None,
    };
    let target = std::env::current_dir()?;

    for line in input.lines() {
        let line = line?;
        let record = match decode_line(&line)? {
            Line::Blank => continue,
            Line::Passthrough(raw) => {
                writeln!(out, "{raw}")?;
                continue;
            }
            Line::Record(record) => record,
        };
        if record.is_delete() {
            writeln!(out, "{}", record.encode())?;
            continue;
        }

        let src = opts.dir.join(&record.path);
        let dest = target.join(&record.path);
        if dest.symlink_metadata().is_ok() {
            fs::remove_file(&dest)
                .with_context(|| format!("clearing {}", dest.display()))?;
        }

        // Symlinks are re-created unconditionally; everything else must
        // agree on content first.
        let matches = record.is_symlink()
            || match &seed_checksums {
                Some(map) => map.get(&record.path) == Some(&record.checksum),
                None => {
                    o4_pyforce::checksum(&src, &record.size)?.as_deref()
                        == Some(record.checksum.as_str())
                }
            };
        if !matches {
            writeln!(out, "{}", record.encode())?;
            continue;
        }
        if let Err(e) = transfer(&src, &dest, opts.move_files) {
            writeln!(
                out,
                "{}",
                passthrough(
                    PassKind::Warn,
                    &format!("seed transfer of {} failed: {e}", src.display()),
                )
            )?;
            // Let the server provide it instead.
            writeln!(out, "{}", record.encode())?;
        } else {
            debug!(path = %record.path, "seeded");
        }
    }
    Ok(())
}

fn transfer(src: &Path, dest: &Path, move_files: bool) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    // Cross-device seeds fall through from rename to copy-and-remove.
    if move_files && fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    let meta = src.symlink_metadata()?;
    if meta.file_type().is_symlink() {
        std::os::unix::fs::symlink(fs::read_link(src)?, dest)?;
    } else {
        fs::copy(src, dest)?;
    }
    if move_files {
        fs::remove_file(src)?;
    }
    Ok(())
}
