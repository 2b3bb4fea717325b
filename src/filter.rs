//! Record filter stages: `o4 keep`, `o4 drop`, `o4 keep-any`.
//!
//! A filter forwards or swallows each record according to a set of
//! predicates combined by the filter mode: `keep` forwards when every
//! predicate holds, `keep-any` when at least one does, `drop` when none do.
//! Passthrough control lines are always forwarded.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use o4_fstat::record::{Line, decode_line};
use o4_fstat::FstatRecord;
use o4_pyforce::checksum;

use crate::context::Context;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterMode {
    Keep,
    KeepAny,
    Drop,
}

/// One testable property of a record against the workspace.
#[derive(Clone, Debug)]
pub enum Predicate {
    /// The record is a delete (empty checksum).
    Deletes,
    /// File presence on disk matches the record: exists (and is not a
    /// directory) iff the record is not a delete.
    Existence,
    /// On-disk content matches the declared checksum (symlinks trivially
    /// match; a directory satisfies a delete).
    Checksum,
    /// The on-disk path matches the record's case exactly. Only meaningful
    /// on case-insensitive filesystems; elsewhere it is always true.
    Case,
    /// The file is currently open for edit in p4.
    Open,
    /// The record's path is in the given list AND the file is absent.
    Deleted(BTreeSet<String>),
}

/// A filter stage: mode plus `(predicate, inverted)` pairs.
pub struct FilterStage {
    mode: FilterMode,
    predicates: Vec<(Predicate, bool)>,
    ctx: Context,
    case_cache: DirCache,
    /// Lazily loaded `p4 opened` set, shared by all `Open` predicates of
    /// this stage — one server call per stage, not per record.
    opened: Option<HashSet<String>>,
}

impl FilterStage {
    pub fn new(ctx: Context, mode: FilterMode, predicates: Vec<(Predicate, bool)>) -> Result<Self> {
        if predicates.is_empty() {
            bail!("no predicates supplied to the filter");
        }
        Ok(Self {
            mode,
            predicates,
            ctx,
            case_cache: DirCache::default(),
            opened: None,
        })
    }

    pub fn run(&mut self, input: &mut dyn BufRead, out: &mut dyn Write) -> Result<()> {
        for line in input.lines() {
            let line = line?;
            match decode_line(&line)? {
                Line::Blank => {}
                Line::Passthrough(raw) => writeln!(out, "{raw}")?,
                Line::Record(record) => {
                    if self.matches(&record)? {
                        writeln!(out, "{}", record.encode())?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn matches(&mut self, record: &FstatRecord) -> Result<bool> {
        let mut any = false;
        let mut all = true;
        for (predicate, invert) in &self.predicates {
            let hit =
                test(predicate, record, &self.ctx, &mut self.case_cache, &mut self.opened)?
                    != *invert;
            any |= hit;
            all &= hit;
        }
        Ok(match self.mode {
            FilterMode::Keep => all,
            FilterMode::KeepAny => any,
            FilterMode::Drop => !any,
        })
    }
}

fn test(
    predicate: &Predicate,
    record: &FstatRecord,
    ctx: &Context,
    case_cache: &mut DirCache,
    opened: &mut Option<HashSet<String>>,
) -> Result<bool> {
    let path = Path::new(&record.path);
    Ok(match predicate {
        Predicate::Deletes => record.is_delete(),
        Predicate::Existence => file_present(path) == !record.is_delete(),
        Predicate::Checksum => {
            if lexists(path) {
                if record.is_delete() {
                    path.is_dir()
                } else if record.is_symlink() {
                    true
                } else {
                    checksum(path, &record.size)?.as_deref() == Some(record.checksum.as_str())
                }
            } else {
                record.is_delete()
            }
        }
        Predicate::Case => case_cache.caseful_accurate(&record.path),
        Predicate::Open => {
            if opened.is_none() {
                let files = crate::context::opened_files(ctx.depot_root())?;
                *opened = Some(files.into_iter().map(|(path, _)| path).collect());
            }
            opened.as_ref().is_some_and(|set| set.contains(&record.path))
        }
        Predicate::Deleted(names) => names.contains(&record.path) && !path.exists(),
    })
}

/// The file exists and is not a directory (symlinks count as present, even
/// dangling ones; a directory where a file should be does not).
fn file_present(path: &Path) -> bool {
    lexists(path) && !path.is_dir()
}

fn lexists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

/// Per-directory listing cache for caseful path verification. On a
/// case-insensitive filesystem a file can be reachable under the wrong
/// case; syncing it there would diverge from the depot.
#[derive(Default)]
pub struct DirCache {
    listings: HashMap<PathBuf, HashSet<String>>,
}

impl DirCache {
    /// True when `path` names an existing file by its exact on-disk case,
    /// checked component by component. Always true on case-sensitive
    /// filesystems (and for paths that do not exist).
    pub fn caseful_accurate(&mut self, path: &str) -> bool {
        if !cfg!(target_os = "macos") || !lexists(Path::new(path)) {
            return true;
        }
        let mut current = path;
        while current != "." && !current.is_empty() {
            let (dir, base) = match current.rsplit_once('/') {
                Some((dir, base)) => (dir, base),
                None => (".", current),
            };
            let listing = self
                .listings
                .entry(PathBuf::from(dir))
                .or_insert_with(|| {
                    std::fs::read_dir(dir)
                        .map(|entries| {
                            entries
                                .flatten()
                                .map(|e| e.file_name().to_string_lossy().into_owned())
                                .collect()
                        })
                        .unwrap_or_default()
                });
            if !listing.contains(base) {
                return false;
            }
            current = if dir == "." { "" } else { dir };
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use o4_fstat::record::decode_line as decode;
    use std::fs;
    use tempfile::TempDir;

    fn ctx() -> Context {
        Context {
            depot_path: "//depot/app/...".to_owned(),
            client_root: PathBuf::from("/tmp"),
            client_path: "//client/app".to_owned(),
            changelist: 0,
        }
    }

    fn record(line: &str) -> FstatRecord {
        match decode(line).unwrap() {
            Line::Record(r) => r,
            other => panic!("{other:?}"),
        }
    }

    fn stage(mode: FilterMode, predicates: Vec<(Predicate, bool)>) -> FilterStage {
        FilterStage::new(ctx(), mode, predicates).unwrap()
    }

    /// Run predicates against records with paths under a temp workspace.
    fn in_dir(dir: &TempDir, rel: &str) -> String {
        dir.path().join(rel).display().to_string()
    }

    #[test]
    fn empty_predicate_set_is_an_error() {
        assert!(FilterStage::new(ctx(), FilterMode::Keep, Vec::new()).is_err());
    }

    #[test]
    fn deletes_predicate() {
        let mut s = stage(FilterMode::Keep, vec![(Predicate::Deletes, false)]);
        assert!(s.matches(&record("1,gone,0,0,")).unwrap());
        assert!(!s.matches(&record("1,kept,1,3,ABCD")).unwrap());
    }

    #[test]
    fn existence_predicate() {
        let dir = TempDir::new().unwrap();
        let present = in_dir(&dir, "present.txt");
        fs::write(&present, "abc").unwrap();
        let missing = in_dir(&dir, "missing.txt");

        let mut s = stage(FilterMode::Keep, vec![(Predicate::Existence, false)]);
        // Non-delete + file present: correct.
        assert!(s
            .matches(&record(&format!("1,{present},1,3,ABCD")))
            .unwrap());
        // Non-delete + missing: wrong.
        assert!(!s
            .matches(&record(&format!("1,{missing},1,3,ABCD")))
            .unwrap());
        // Delete + missing: correct.
        assert!(s.matches(&record(&format!("1,{missing},0,0,"))).unwrap());
        // Delete + present: wrong.
        assert!(!s.matches(&record(&format!("1,{present},0,0,"))).unwrap());
    }

    #[test]
    fn checksum_predicate_and_inversion() {
        let dir = TempDir::new().unwrap();
        let path = in_dir(&dir, "a.txt");
        fs::write(&path, "abc").unwrap();
        let good = format!("1,{path},1,3,900150983CD24FB0D6963F7D28E17F72");
        let bad = format!("1,{path},1,3,00000000000000000000000000000000");

        let mut keep = stage(FilterMode::Keep, vec![(Predicate::Checksum, false)]);
        assert!(keep.matches(&record(&good)).unwrap());
        assert!(!keep.matches(&record(&bad)).unwrap());

        // drop --checksum forwards only mismatches: the retry-loop filter.
        let mut drop = stage(FilterMode::Drop, vec![(Predicate::Checksum, false)]);
        assert!(!drop.matches(&record(&good)).unwrap());
        assert!(drop.matches(&record(&bad)).unwrap());
    }

    #[test]
    fn drop_mode_forwards_when_no_predicate_hits() {
        let dir = TempDir::new().unwrap();
        let present = in_dir(&dir, "f");
        fs::write(&present, "x").unwrap();
        // drop --not-deletes --existence: forwards deletes whose file still
        // exists — the delete pass of a sync.
        let mut s = stage(
            FilterMode::Drop,
            vec![(Predicate::Deletes, true), (Predicate::Existence, false)],
        );
        assert!(s.matches(&record(&format!("1,{present},0,0,"))).unwrap());
        let missing = in_dir(&dir, "gone");
        assert!(!s.matches(&record(&format!("1,{missing},0,0,"))).unwrap());
    }

    #[test]
    fn keep_any_mode() {
        let mut s = stage(
            FilterMode::KeepAny,
            vec![(Predicate::Deletes, false), (Predicate::Deletes, true)],
        );
        // One of the two opposite predicates always holds.
        assert!(s.matches(&record("1,x,1,1,AB")).unwrap());
        assert!(s.matches(&record("1,x,0,0,")).unwrap());
    }

    #[test]
    fn deleted_list_predicate() {
        let dir = TempDir::new().unwrap();
        let missing = in_dir(&dir, "renamed.c");
        let mut set = BTreeSet::new();
        set.insert(missing.clone());
        let mut s = stage(FilterMode::Keep, vec![(Predicate::Deleted(set), false)]);
        assert!(s.matches(&record(&format!("1,{missing},1,1,AB"))).unwrap());
        assert!(!s.matches(&record("1,other,1,1,AB")).unwrap());
    }

    #[test]
    fn case_predicate_is_identity_on_case_sensitive_fs() {
        if cfg!(target_os = "macos") {
            return;
        }
        let mut cache = DirCache::default();
        assert!(cache.caseful_accurate("Whatever/Mixed/Case.txt"));
    }

    #[test]
    fn symlinks_count_as_present_and_match_checksums() {
        let dir = TempDir::new().unwrap();
        let link = in_dir(&dir, "link");
        std::os::unix::fs::symlink("no-such-target", &link).unwrap();

        let mut s = stage(FilterMode::Keep, vec![(Predicate::Existence, false)]);
        assert!(s
            .matches(&record(&format!("1,{link},1,14/symlink,ABCD")))
            .unwrap());
        let mut c = stage(FilterMode::Keep, vec![(Predicate::Checksum, false)]);
        assert!(c
            .matches(&record(&format!("1,{link},1,14/symlink,ABCD")))
            .unwrap());
    }
}
