//! The fstat merge iterator.
//!
//! Combines up to three sources — the remote fstat service, `p4 fstat`, and
//! the best local cache file — into a single stream of records with
//! `from_cl < changelist ≤ to_cl`, ordered by descending changelist, while
//! concurrently authoring the next cache file at the highest changelist
//! seen. The new cache only becomes visible on clean completion (temp file
//! + rename), so interrupted runs leave the store untouched.
//!
//! Callers MUST consume the iterator fully (or call [`FstatMerge::drain`]):
//! stopping early forfeits the new cache file and doubles the server work
//! of the next sync.

use std::collections::{HashSet, VecDeque};
use std::io::{BufRead, BufReader, Lines};
use std::path::PathBuf;

use flate2::read::MultiGzDecoder;
use o4_pyforce::{Flavor, P4Error, Pyforce, SizeSpec};
use tracing::{debug, info, warn};

use crate::cache::{self, CacheWriter};
use crate::error::FstatError;
use crate::record::{FstatRecord, Line, Revision, decode_line, sort_newest_first};
use crate::server::{FetchOutcome, FstatServer};

const FSTAT_FIELDS: &str =
    "headAction, headType, digest, fileSize, depotFile, headChange, headRev";
const RETRIES: u32 = 3;

/// What to merge, for which directory.
pub struct MergeOptions {
    /// Depot path including the trailing `/...`.
    pub depot_path: String,
    pub to_cl: u64,
    pub from_cl: u64,
    /// The workspace's `.o4` directory.
    pub o4_dir: PathBuf,
    /// Remote fstat service, when configured.
    pub server: Option<FstatServer>,
}

type CacheLines = Lines<BufReader<MultiGzDecoder<std::fs::File>>>;

enum State {
    Start,
    /// The cache is already at `to_cl`: stream it, author nothing.
    FastCache(CacheLines),
    /// Emitting the freshly retrieved delta; the prior cache (if any) is
    /// copied afterwards.
    Delta(Option<CacheLines>),
    /// Copying the prior cache through the writer, suppressing paths the
    /// delta superseded.
    CacheCopy(CacheLines),
    Done,
}

pub struct FstatMerge {
    opts: MergeOptions,
    state: State,
    cache_cl: u64,
    cache_path: Option<PathBuf>,
    /// Paths already retrieved from newer sources; a cache record for any of
    /// these is superseded.
    seen_paths: HashSet<String>,
    pending: VecDeque<FstatRecord>,
    writer: Option<CacheWriter>,
    /// The highest changelist seen anywhere — the name of the new cache file.
    highest_cl: Option<u64>,
}

enum Retrieve {
    Timeout,
    MaxRowsScanned,
    Fatal(FstatError),
}

impl FstatMerge {
    pub fn new(opts: MergeOptions) -> Self {
        Self {
            opts,
            state: State::Start,
            cache_cl: 0,
            cache_path: None,
            seen_paths: HashSet::new(),
            pending: VecDeque::new(),
            writer: None,
            highest_cl: None,
        }
    }

    /// Consume whatever remains so the cache file gets published. Returns
    /// the changelist the stream topped out at, if any records were seen.
    pub fn drain(&mut self) -> Result<Option<u64>, FstatError> {
        for item in &mut *self {
            item?;
        }
        Ok(self.highest_cl)
    }

    fn in_range(&self, cl: u64) -> bool {
        self.opts.from_cl < cl && cl <= self.opts.to_cl
    }

    /// First-call setup: locate the cache, retrieve the delta, open the
    /// writer.
    fn start(&mut self) -> Result<(), FstatError> {
        if let Some((cl, path)) = cache::find_nearest(&self.opts.o4_dir, self.opts.to_cl) {
            self.cache_cl = cl;
            self.cache_path = Some(path);
        }

        if self.cache_cl == self.opts.to_cl {
            let path = self
                .cache_path
                .as_ref()
                .expect("cache path is recorded alongside cache_cl");
            debug!(cl = self.cache_cl, "fstat cache hit, streaming directly");
            self.highest_cl = Some(self.cache_cl);
            self.state = State::FastCache(cache::read_lines(path)?);
            return Ok(());
        }

        let delta = self.retrieve_delta()?;
        let mut writer = CacheWriter::create(&self.opts.o4_dir)?;
        for record in &delta {
            writer.write_record(record)?;
        }
        self.writer = Some(writer);
        self.highest_cl = delta.first().map(|r| r.changelist);
        self.pending = delta.into();

        let cache_lines = match &self.cache_path {
            Some(path) => Some(cache::read_lines(path)?),
            None => None,
        };
        self.state = State::Delta(cache_lines);
        Ok(())
    }

    /// Retrieve all records in `(cache_cl, to_cl]` from the remote service
    /// and/or Perforce, newest source first, deduplicated by path, sorted
    /// newest first. Retries timeouts; drops a cache that trips the server's
    /// row-scan limit.
    fn retrieve_delta(&mut self) -> Result<Vec<FstatRecord>, FstatError> {
        let mut retries = RETRIES;
        loop {
            match self.try_retrieve() {
                Ok(records) => return Ok(records),
                Err(Retrieve::Timeout) => {
                    retries -= 1;
                    if retries == 0 {
                        return Err(FstatError::TimeoutsExhausted {
                            depot_path: self.opts.depot_path.clone(),
                        });
                    }
                    warn!(
                        remaining = retries,
                        "p4 timed out while retrieving fstat, retrying"
                    );
                }
                Err(Retrieve::MaxRowsScanned) => {
                    if self.cache_cl == 0 {
                        return Err(FstatError::RequestTooLarge {
                            depot_path: self.opts.depot_path.clone(),
                        });
                    }
                    warn!(
                        cache = self.cache_cl,
                        "server row-scan limit hit, ignoring local cache and widening the range"
                    );
                    self.cache_cl = 0;
                    self.cache_path = None;
                }
                Err(Retrieve::Fatal(e)) => return Err(e),
            }
        }
    }

    fn try_retrieve(&mut self) -> Result<Vec<FstatRecord>, Retrieve> {
        let lower = self.cache_cl;
        let to_cl = self.opts.to_cl;
        let mut collected: Vec<FstatRecord> = Vec::new();

        let mut p4_ranges: Vec<(u64, u64)> = Vec::new();
        let mut remote_pass: Option<(u64, u64)> = None;

        match &self.opts.server {
            None => p4_ranges.push((lower, to_cl)),
            Some(server) => match server.fetch(&self.opts.depot_path, to_cl) {
                Ok(FetchOutcome::Stream(stream)) => {
                    read_remote(stream, lower, &mut collected)?;
                }
                Ok(FetchOutcome::Redirect(r)) if r > to_cl => {
                    warn!(
                        redirect = r,
                        target = to_cl,
                        "fstat server is ahead of the requested changelist, skipping it"
                    );
                    p4_ranges.push((lower, to_cl));
                }
                Ok(FetchOutcome::Redirect(r)) if r > lower => {
                    debug!(redirect = r, "splitting fstat retrieval around server redirect");
                    p4_ranges.push((r, to_cl));
                    remote_pass = Some((lower, r));
                }
                Ok(FetchOutcome::Redirect(r)) => {
                    debug!(redirect = r, cache = lower, "server has nothing newer than the cache");
                    p4_ranges.push((lower, to_cl));
                }
                Ok(FetchOutcome::Unavailable(reason)) => {
                    info!(%reason, "fstat server unavailable, using Perforce");
                    p4_ranges.push((lower, to_cl));
                }
                Err(e) => return Err(Retrieve::Fatal(e)),
            },
        }

        for (lo, hi) in p4_ranges {
            self.p4_fstat(lo, hi, &mut collected)?;
        }
        if let Some((lo, hi)) = remote_pass {
            let server = self.opts.server.as_ref().expect("remote pass implies server");
            match server.fetch(&self.opts.depot_path, hi) {
                Ok(FetchOutcome::Stream(stream)) => read_remote(stream, lo, &mut collected)?,
                Ok(_) | Err(_) => {
                    info!(cl = hi, "redirected fstat fetch fell through, using Perforce");
                    self.p4_fstat(lo, hi, &mut collected)?;
                }
            }
        }

        // One record per path; sources were consumed newest range first, so
        // the first occurrence wins.
        let mut unique = HashSet::new();
        collected.retain(|r| unique.insert(r.path.clone()));
        sort_newest_first(&mut collected);

        if self.cache_cl > 0 {
            self.seen_paths = collected.iter().map(|r| r.path.clone()).collect();
        }
        Ok(collected)
    }

    /// One `p4 fstat` invocation covering `(lower, upper]`, appended to
    /// `out`.
    fn p4_fstat(&self, lower: u64, upper: u64, out: &mut Vec<FstatRecord>) -> Result<(), Retrieve> {
        if lower >= upper {
            return Ok(());
        }
        let revs = if lower > 0 {
            format!("@{lower},@{upper}")
        } else {
            format!("@{upper}")
        };
        let args = [
            "fstat".to_owned(),
            "-Rc".to_owned(),
            "-Ol".to_owned(),
            "-Os".to_owned(),
            "-T".to_owned(),
            FSTAT_FIELDS.to_owned(),
            format!("{}{revs}", o4_pyforce::escape(&self.opts.depot_path)),
        ];
        // Depot prefix to strip: the path without its `...` wildcard.
        let head_len = self.opts.depot_path.trim_end_matches("...").len();

        let pyf = Pyforce::spawn(args).map_err(|e| self.classify_p4(e))?;
        for result in pyf {
            match result {
                Ok(record) => {
                    if record.code() != "stat" {
                        continue;
                    }
                    match fstatify(&record, head_len) {
                        Some(r) => out.push(r),
                        None => warn!(
                            file = %record.text("depotFile").unwrap_or_default(),
                            "skipping p4 fstat record with missing fields"
                        ),
                    }
                }
                Err(e) => {
                    match self.classify_p4(e) {
                        // An empty directory is not an error.
                        Retrieve::Fatal(FstatError::P4(P4Error::Failed(records)))
                            if records
                                .iter()
                                .all(|r| r.data().contains("no such file(s)")) =>
                        {
                            break;
                        }
                        other => return Err(other),
                    }
                }
            }
        }
        Ok(())
    }

    fn classify_p4(&self, e: P4Error) -> Retrieve {
        match &e {
            P4Error::Timeout(_) => Retrieve::Timeout,
            P4Error::Failed(records) => {
                for record in records {
                    let data = record.data();
                    if data.contains("Too many rows scanned") {
                        return Retrieve::MaxRowsScanned;
                    }
                    if data.contains("Request too large") {
                        return Retrieve::Fatal(FstatError::RequestTooLarge {
                            depot_path: self.opts.depot_path.clone(),
                        });
                    }
                }
                Retrieve::Fatal(e.into())
            }
            _ => Retrieve::Fatal(e.into()),
        }
    }

    /// End of stream: publish the authored cache file.
    fn finish(&mut self) -> Result<(), FstatError> {
        if let (Some(writer), Some(cl)) = (self.writer.take(), self.highest_cl) {
            writer.publish(cl)?;
        }
        Ok(())
    }
}

/// Map one `p4 fstat` result dict to a record. `head_len` is the byte length
/// of the depot prefix to strip from `depotFile`.
fn fstatify(record: &o4_pyforce::P4Record, head_len: usize) -> Option<FstatRecord> {
    let changelist: u64 = record.text("headChange")?.parse().ok()?;
    let revision: u32 = record.text("headRev")?.parse().ok()?;
    let action = record.text("headAction")?.into_owned();
    let file_type = record.text("headType")?.into_owned();
    let depot_file = o4_pyforce::unescape(&record.text("depotFile")?);
    let path = depot_file.get(head_len..)?.to_owned();

    let flavor = if file_type.contains("utf16") {
        Flavor::Utf16
    } else if file_type.contains("utf8") {
        Flavor::Utf8
    } else if file_type.contains("symlink") {
        Flavor::Symlink
    } else {
        Flavor::Plain
    };
    let deleted = action.ends_with("delete");
    let bytes: u64 = record
        .text("fileSize")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    Some(FstatRecord {
        changelist,
        path,
        revision: Revision::Number(revision),
        size: if deleted {
            SizeSpec::default()
        } else {
            SizeSpec::new(bytes, flavor)
        },
        checksum: if deleted {
            String::new()
        } else {
            record.text("digest").unwrap_or_default().into_owned()
        },
    })
}

/// Read records from a remote stream until the changelist falls to or below
/// `lower` (the stream is ordered newest first).
fn read_remote(
    stream: Box<dyn BufRead + Send>,
    lower: u64,
    out: &mut Vec<FstatRecord>,
) -> Result<(), Retrieve> {
    for line in stream.lines() {
        let line = line.map_err(|e| Retrieve::Fatal(e.into()))?;
        match decode_line(&line).map_err(Retrieve::Fatal)? {
            Line::Record(record) => {
                if record.changelist <= lower {
                    break;
                }
                out.push(record);
            }
            Line::Blank | Line::Passthrough(_) => {}
        }
    }
    Ok(())
}

impl Iterator for FstatMerge {
    type Item = Result<FstatRecord, FstatError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            // Own the state for this step; every early return below either
            // restored it or deliberately left it at Done.
            match std::mem::replace(&mut self.state, State::Done) {
                State::Start => {
                    if let Err(e) = self.start() {
                        return Some(Err(e));
                    }
                }
                State::FastCache(mut lines) => match lines.next() {
                    Some(Ok(line)) => match decode_line(&line) {
                        Ok(Line::Record(record)) => {
                            if record.changelist <= self.opts.from_cl {
                                return None;
                            }
                            let emit = record.changelist <= self.opts.to_cl;
                            self.state = State::FastCache(lines);
                            if emit {
                                return Some(Ok(record));
                            }
                        }
                        Ok(_) => self.state = State::FastCache(lines),
                        Err(e) => return Some(Err(e)),
                    },
                    Some(Err(e)) => return Some(Err(e.into())),
                    None => return None,
                },
                State::Delta(cache_lines) => match self.pending.pop_front() {
                    Some(record) => {
                        let emit = self.in_range(record.changelist);
                        self.state = State::Delta(cache_lines);
                        if emit {
                            return Some(Ok(record));
                        }
                    }
                    None => match cache_lines {
                        Some(lines) => self.state = State::CacheCopy(lines),
                        None => {
                            if let Err(e) = self.finish() {
                                return Some(Err(e));
                            }
                            return None;
                        }
                    },
                },
                State::CacheCopy(mut lines) => match lines.next() {
                    Some(Ok(line)) => match decode_line(&line) {
                        Ok(Line::Record(record)) => {
                            if self.seen_paths.remove(&record.path) {
                                self.state = State::CacheCopy(lines);
                                continue;
                            }
                            if self.highest_cl.is_none() {
                                self.highest_cl = Some(record.changelist);
                            }
                            if let Some(writer) = &mut self.writer {
                                if let Err(e) = writer.write_record(&record) {
                                    return Some(Err(e.into()));
                                }
                            }
                            let emit = self.in_range(record.changelist);
                            self.state = State::CacheCopy(lines);
                            if emit {
                                return Some(Ok(record));
                            }
                        }
                        Ok(_) => self.state = State::CacheCopy(lines),
                        Err(e) => return Some(Err(e)),
                    },
                    Some(Err(e)) => return Some(Err(e.into())),
                    None => {
                        if let Err(e) = self.finish() {
                            return Some(Err(e));
                        }
                        return None;
                    }
                },
                State::Done => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Line as RecLine;
    use tempfile::TempDir;

    fn record(line: &str) -> FstatRecord {
        match decode_line(line).unwrap() {
            RecLine::Record(r) => r,
            other => panic!("{other:?}"),
        }
    }

    fn publish_cache(o4_dir: &std::path::Path, cl: u64, lines: &[&str]) {
        let mut w = CacheWriter::create(o4_dir).unwrap();
        for line in lines {
            w.write_record(&record(line)).unwrap();
        }
        w.publish(cl).unwrap();
    }

    fn merge(o4_dir: &std::path::Path, to_cl: u64, from_cl: u64) -> FstatMerge {
        FstatMerge::new(MergeOptions {
            depot_path: "//depot/app/...".to_owned(),
            to_cl,
            from_cl,
            o4_dir: o4_dir.to_owned(),
            server: None,
        })
    }

    #[test]
    fn cache_hit_streams_without_touching_p4() {
        let dir = TempDir::new().unwrap();
        let o4 = dir.path().join(".o4");
        publish_cache(&o4, 20, &["20,b.txt,2,3,BBBB", "10,a.txt,1,3,AAAA"]);

        // No p4 shim exists in this test environment; a cache hit must not
        // need one.
        let records: Vec<_> = merge(&o4, 20, 0).collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, "b.txt");
        assert_eq!(records[1].path, "a.txt");
    }

    #[test]
    fn cache_hit_respects_from_cl_and_stops_early() {
        let dir = TempDir::new().unwrap();
        let o4 = dir.path().join(".o4");
        publish_cache(
            &o4,
            30,
            &["30,c.txt,3,3,CCCC", "20,b.txt,2,3,BBBB", "10,a.txt,1,3,AAAA"],
        );
        let records: Vec<_> = merge(&o4, 30, 20).collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "c.txt");
    }

    #[test]
    fn drain_reports_top_changelist() {
        let dir = TempDir::new().unwrap();
        let o4 = dir.path().join(".o4");
        publish_cache(&o4, 40, &["40,a.txt,1,1,AAAA"]);
        let mut m = merge(&o4, 40, 0);
        assert_eq!(m.drain().unwrap(), Some(40));
    }
}
