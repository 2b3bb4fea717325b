//! `o4 head`: resolve and cache the most recent submitted changelist for
//! one or more depot directories.

use std::path::Path;

use anyhow::{Result, anyhow, bail};
use o4_fstat::cache;
use o4_pyforce::{P4Error, Pyforce};
use tracing::warn;

const RETRIES: u32 = 3;

/// Resolve head for each depot path (`//depot/dir` form, `/...` implied),
/// writing each directory's `.o4/head` marker on the way.
pub fn run(client_root: &Path, paths: &[String]) -> Result<Vec<u64>> {
    let args: Vec<String> = paths
        .iter()
        .map(|p| {
            let p = p.trim_end_matches('/');
            if p.ends_with("/...") {
                o4_pyforce::escape(p)
            } else {
                o4_pyforce::escape(&format!("{p}/..."))
            }
        })
        .collect();

    for attempt in 1..=RETRIES {
        match head_update(client_root, &args) {
            Ok(res) => return Ok(res),
            Err(HeadError::Retryable(msg)) => {
                warn!(attempt, "retrieving head changelist failed: {msg}");
            }
            Err(HeadError::Fatal(e)) => return Err(e),
        }
    }
    bail!("there was an error retrieving the head change for {args:?}");
}

enum HeadError {
    Retryable(String),
    Fatal(anyhow::Error),
}

fn head_update(client_root: &Path, args: &[String]) -> Result<Vec<u64>, HeadError> {
    let mut p4args = vec![
        "changes".to_owned(),
        "-s".to_owned(),
        "submitted".to_owned(),
        "-m1".to_owned(),
    ];
    p4args.extend(args.iter().cloned());

    let records = Pyforce::run(p4args).map_err(|e| match e {
        P4Error::Timeout(msg) => HeadError::Retryable(msg),
        other => HeadError::Fatal(other.into()),
    })?;

    let mut resolved: Vec<Option<u64>> = vec![None; args.len()];
    for record in records {
        let Some(spath) = record.text("path").map(|s| s.into_owned()) else {
            warn!("p4 changes result without a path field");
            continue;
        };
        let change: Option<u64> = record.text("change").and_then(|c| c.parse().ok());
        let mut matched = false;
        for (i, arg) in args.iter().enumerate() {
            if resolved[i].is_some() {
                continue;
            }
            // p4 may rewrite the path when nothing matched until further
            // down the tree; prefix-compare both ways (minus the `...`).
            let arg_stem = &arg[..arg.len().saturating_sub(3)];
            let spath_stem = &spath[..spath.len().saturating_sub(3)];
            if spath.starts_with(arg_stem) || arg.starts_with(spath_stem) {
                let Some(cl) = change else { break };
                resolved[i] = Some(cl);
                let o4_dir = o4_dir_for(client_root, arg);
                if let Err(e) = cache::write_head_changelist(&o4_dir, cl) {
                    warn!(dir = %o4_dir.display(), "could not cache head: {e}");
                }
                matched = true;
                break;
            }
        }
        if !matched {
            warn!(path = %spath, "could not map a p4 changes result to a request");
        }
    }

    let mut out = Vec::with_capacity(args.len());
    for (i, arg) in args.iter().enumerate() {
        match resolved[i] {
            Some(cl) => out.push(cl),
            None => {
                // An unresolvable path must not leave a stale marker behind.
                let _ = std::fs::remove_file(o4_dir_for(client_root, arg).join("head"));
                return Err(HeadError::Retryable(format!(
                    "could not get HEAD for {arg}"
                )));
            }
        }
    }
    Ok(out)
}

/// `//depot/dir/...` → `<client_root>/depot/dir/.o4`.
fn o4_dir_for(client_root: &Path, depot_arg: &str) -> std::path::PathBuf {
    let rel = depot_arg
        .trim_start_matches('/')
        .trim_end_matches("/...")
        .to_owned();
    client_root.join(rel).join(".o4")
}

/// Head for a single directory, honoring the `$O4HEAD` override.
pub fn resolve_single(client_root: &Path, depot_path: &str) -> Result<u64> {
    if let Ok(v) = std::env::var("O4HEAD") {
        if let Ok(cl) = v.parse::<u64>() {
            if cl > 0 {
                return Ok(cl);
            }
        }
    }
    let heads = run(client_root, &[depot_path.to_owned()])?;
    heads
        .first()
        .copied()
        .ok_or_else(|| anyhow!("no head changelist for {depot_path}"))
}
