//! The per-directory `.o4/` metadata store.
//!
//! A workspace directory owns its `.o4/` subdirectory. Cache files are
//! `<CL>.fstat.gz` — gzipped record streams, one record per path, newest
//! changelist first, published by temp-file + rename and then made
//! read-only. Alongside them live three small markers: `changelist` (the
//! last fully verified sync target), `head` (cached most-recent server
//! change), and `sync-incomplete` (soft-failure flag).

use std::fs::{self, File, Permissions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::FstatError;
use crate::record::{COLUMNS_BANNER, FstatRecord};

pub const SYNCED_CL_FILE: &str = "changelist";
pub const HEAD_FILE: &str = "head";
pub const INCOMPLETE_FILE: &str = "sync-incomplete";

const ARCHIVE_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// Changelist numbers of every `*.fstat.gz` in `o4_dir`, unordered.
fn cache_changelists(o4_dir: &Path) -> Vec<(u64, PathBuf)> {
    let pattern = format!("{}/*.fstat.gz", o4_dir.display());
    let mut found = Vec::new();
    let Ok(paths) = glob::glob(&pattern) else {
        return found;
    };
    for path in paths.flatten() {
        if let Some(cl) = file_changelist(&path) {
            found.push((cl, path));
        }
    }
    found
}

/// The leading `<CL>.` of a cache or archive file name.
fn file_changelist(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .split('.')
        .next()?
        .parse()
        .ok()
}

/// The best cache file at or below `cl`: the largest cached changelist not
/// exceeding it.
pub fn find_nearest(o4_dir: &Path, cl: u64) -> Option<(u64, PathBuf)> {
    cache_changelists(o4_dir)
        .into_iter()
        .filter(|(c, _)| *c <= cl)
        .max_by_key(|(c, _)| *c)
}

/// Iterate the raw lines of a gzipped cache file.
pub fn read_lines(path: &Path) -> io::Result<io::Lines<BufReader<MultiGzDecoder<File>>>> {
    let file = File::open(path)?;
    Ok(BufReader::new(MultiGzDecoder::new(file)).lines())
}

/// Iterate the decoded records of a gzipped cache file, skipping comments.
pub fn read_records(
    path: &Path,
) -> io::Result<impl Iterator<Item = Result<FstatRecord, FstatError>>> {
    let lines = read_lines(path)?;
    Ok(lines.filter_map(|line| match line {
        Ok(line) => match crate::record::decode_line(&line) {
            Ok(crate::record::Line::Record(r)) => Some(Ok(r)),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        },
        Err(e) => Some(Err(e.into())),
    }))
}

/// An in-progress cache file.
///
/// Writes go to a gzipped temp file inside `o4_dir`; nothing is visible
/// until [`publish`](Self::publish) renames it into place and drops write
/// permission. Dropping the writer without publishing unlinks the temp file.
pub struct CacheWriter {
    o4_dir: PathBuf,
    encoder: GzEncoder<BufWriter<NamedTempFile>>,
}

impl CacheWriter {
    pub fn create(o4_dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(o4_dir)?;
        let tmp = NamedTempFile::new_in(o4_dir)?;
        let mut encoder = GzEncoder::new(BufWriter::new(tmp), Compression::best());
        writeln!(encoder, "{COLUMNS_BANNER}")?;
        Ok(Self {
            o4_dir: o4_dir.to_owned(),
            encoder,
        })
    }

    pub fn write_record(&mut self, record: &FstatRecord) -> io::Result<()> {
        writeln!(self.encoder, "{}", record.encode())
    }

    /// Finish compression and atomically rename to `<cl>.fstat.gz`.
    pub fn publish(self, cl: u64) -> io::Result<PathBuf> {
        let tmp = self.encoder.finish()?.into_inner().map_err(|e| e.into_error())?;
        tmp.as_file().sync_all()?;
        let target = self.o4_dir.join(format!("{cl}.fstat.gz"));
        // persist() renames over an existing read-only file; write
        // permission on the new file is dropped afterwards.
        tmp.persist(&target).map_err(|e| e.error)?;
        fs::set_permissions(&target, Permissions::from_mode(0o444))?;
        debug!(cache = %target.display(), "published fstat cache");
        Ok(target)
    }
}

fn read_marker(path: &Path) -> Option<u64> {
    let content = fs::read_to_string(path).ok()?;
    match content.trim().parse() {
        Ok(cl) => Some(cl),
        Err(_) => {
            warn!(marker = %path.display(), "unreadable changelist marker");
            None
        }
    }
}

fn write_marker(path: &Path, cl: u64) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut tmp = NamedTempFile::new_in(path.parent().unwrap_or(Path::new(".")))?;
    writeln!(tmp, "{cl}")?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// The changelist this directory was last fully synced and verified to.
pub fn synced_changelist(o4_dir: &Path) -> Option<u64> {
    read_marker(&o4_dir.join(SYNCED_CL_FILE))
}

pub fn write_synced_changelist(o4_dir: &Path, cl: u64) -> io::Result<()> {
    write_marker(&o4_dir.join(SYNCED_CL_FILE), cl)
}

pub fn clear_synced_changelist(o4_dir: &Path) -> io::Result<()> {
    match fs::remove_file(o4_dir.join(SYNCED_CL_FILE)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Cached most-recent server changelist for this directory.
pub fn head_changelist(o4_dir: &Path) -> Option<u64> {
    read_marker(&o4_dir.join(HEAD_FILE))
}

pub fn write_head_changelist(o4_dir: &Path, cl: u64) -> io::Result<()> {
    write_marker(&o4_dir.join(HEAD_FILE), cl)
}

pub fn clear_head_changelist(o4_dir: &Path) -> io::Result<()> {
    match fs::remove_file(o4_dir.join(HEAD_FILE)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Soft-failure flag: while present, a completing sync must not publish its
/// changelist marker.
pub fn is_incomplete(o4_dir: &Path) -> bool {
    o4_dir.join(INCOMPLETE_FILE).exists()
}

pub fn set_incomplete(o4_dir: &Path) -> io::Result<()> {
    fs::create_dir_all(o4_dir)?;
    fs::write(o4_dir.join(INCOMPLETE_FILE), b"")
}

pub fn clear_incomplete(o4_dir: &Path) -> io::Result<()> {
    match fs::remove_file(o4_dir.join(INCOMPLETE_FILE)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Thin the fstat cache: drop every other file, always keeping the oldest
/// and the one the directory is currently synced to. Returns the number of
/// files removed.
pub fn prune_fstat_cache(o4_dir: &Path) -> io::Result<usize> {
    let mut files = cache_changelists(o4_dir);
    files.sort_by_key(|(cl, _)| *cl);
    let synced = synced_changelist(o4_dir);
    let mut removed = 0;
    let mut drop_this = true;
    for (i, (cl, path)) in files.iter().enumerate() {
        if i == 0 || Some(*cl) == synced {
            continue;
        }
        if drop_this {
            fs::remove_file(path)?;
            removed += 1;
        }
        drop_this = !drop_this;
    }
    Ok(removed)
}

/// Reclaim archive space: remove `.tgz` archives older than 24 hours, or —
/// when none are that old — the single oldest one. The archive matching the
/// synced changelist is never removed. Returns the number removed.
pub fn prune_archive_cache(o4_dir: &Path) -> io::Result<usize> {
    let pattern = format!("{}/*.tgz", o4_dir.display());
    let synced = synced_changelist(o4_dir);
    let mut candidates: Vec<(SystemTime, PathBuf)> = Vec::new();
    if let Ok(paths) = glob::glob(&pattern) {
        for path in paths.flatten() {
            if file_changelist(&path).is_some_and(|cl| Some(cl) == synced) {
                continue;
            }
            let mtime = fs::metadata(&path)?.modified()?;
            candidates.push((mtime, path));
        }
    }
    let cutoff = SystemTime::now() - ARCHIVE_MAX_AGE;
    let old: Vec<_> = candidates
        .iter()
        .filter(|(mtime, _)| *mtime < cutoff)
        .collect();
    let mut removed = 0;
    if old.is_empty() {
        if let Some((_, path)) = candidates.iter().min_by_key(|(mtime, _)| *mtime) {
            fs::remove_file(path)?;
            removed = 1;
        }
    } else {
        for (_, path) in old {
            fs::remove_file(path)?;
            removed += 1;
        }
    }
    Ok(removed)
}
