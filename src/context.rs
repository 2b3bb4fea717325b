//! The sync context: which depot path, which workspace, which changelist.
//!
//! One `o4` invocation spawns many more (dispatcher children re-enter the
//! CLI), and resolving the context costs p4 round trips — so it is resolved
//! once, carried by value between in-process stages, and marshaled to
//! environment variables (`DEPOT_PATH`, `CLIENT_ROOT`, `CLIENT_PATH`,
//! `CHANGELIST`) only at the process-spawn boundary.

use std::path::PathBuf;

use anyhow::{Context as _, Result, anyhow, bail};
use o4_pyforce::Pyforce;

#[derive(Clone, Debug)]
pub struct Context {
    /// Depot path of the workspace directory, with the trailing `/...`.
    pub depot_path: String,
    /// Root of the Perforce client on disk.
    pub client_root: PathBuf,
    /// Local path prefix corresponding to [`depot_path`](Self::depot_path).
    pub client_path: String,
    /// Target changelist of the current operation (0 when not applicable).
    pub changelist: u64,
}

impl Context {
    /// Resolve from the environment where possible, falling back to p4
    /// queries. Used by stage subcommands running as dispatcher children,
    /// whose parent exported the context before spawning them.
    pub fn from_env() -> Result<Self> {
        let depot_path = match std::env::var("DEPOT_PATH") {
            Ok(v) if !v.is_empty() => v,
            _ => {
                let (depot, _) = p4_where()?;
                format!("{depot}/...")
            }
        };
        let client_path = match std::env::var("CLIENT_PATH") {
            Ok(v) if !v.is_empty() => v,
            _ => p4_where()?.1,
        };
        let changelist = std::env::var("CHANGELIST")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(Self {
            depot_path,
            client_root: client_root()?,
            client_path,
            changelist,
        })
    }

    /// Depot path without the `/...` wildcard.
    pub fn depot_root(&self) -> &str {
        self.depot_path.trim_end_matches("/...")
    }

    /// Turn an absolute client-side path into its depot-side form, when it
    /// lies under this context's client path.
    pub fn client_path_to_depot(&self, path: &str) -> Option<String> {
        path.strip_prefix(&self.client_path)
            .map(|rest| format!("{}{}", self.depot_root(), rest))
    }

    /// The env pairs a child `o4` process needs to skip re-resolution.
    pub fn export(&self) -> Vec<(String, String)> {
        vec![
            ("DEPOT_PATH".to_owned(), self.depot_path.clone()),
            (
                "CLIENT_ROOT".to_owned(),
                self.client_root.display().to_string(),
            ),
            ("CLIENT_PATH".to_owned(), self.client_path.clone()),
            ("CHANGELIST".to_owned(), self.changelist.to_string()),
        ]
    }
}

/// This o4 binary, for self-spawning dispatcher children.
pub fn o4_binary() -> Result<PathBuf> {
    std::env::current_exe().context("locating the o4 binary")
}

/// `p4 where dummy` for the current directory: the depot and client
/// directory prefixes.
fn p4_where() -> Result<(String, String)> {
    let records = Pyforce::run(["where", "dummy"]).context("p4 where")?;
    let record = records
        .first()
        .ok_or_else(|| anyhow!("p4 where returned nothing"))?;
    let depot_file = o4_pyforce::unescape(
        &record
            .text("depotFile")
            .ok_or_else(|| anyhow!("p4 where: no depotFile"))?,
    );
    let client_file = o4_pyforce::unescape(
        &record
            .text("path")
            .or_else(|| record.text("clientFile"))
            .ok_or_else(|| anyhow!("p4 where: no client path"))?,
    );
    Ok((dirname(&depot_file), dirname(&client_file)))
}

fn dirname(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir.to_owned(),
        None => String::new(),
    }
}

/// The client root: `$CLIENT_ROOT`, else `$BLT_HOME`, else `p4 info`.
pub fn client_root() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("CLIENT_ROOT") {
        if !v.is_empty() {
            return Ok(PathBuf::from(v));
        }
    }
    if let Ok(v) = std::env::var("BLT_HOME") {
        if !v.is_empty() {
            return Ok(PathBuf::from(v));
        }
    }
    let records = Pyforce::run(["info"]).context("p4 info")?;
    let record = records
        .first()
        .ok_or_else(|| anyhow!("p4 info returned nothing"))?;
    let root = record
        .text("clientRoot")
        .ok_or_else(|| anyhow!("p4 info: no clientRoot (is P4CLIENT set?)"))?;
    Ok(PathBuf::from(root.into_owned()))
}

/// Check that every active View mapping of the clientspec maps a depot path
/// to the same path under a common client prefix. o4's path arithmetic
/// depends on this.
pub fn clientspec_is_vanilla() -> Result<bool> {
    let records = Pyforce::run(["client", "-o"]).context("p4 client -o")?;
    let record = records
        .first()
        .ok_or_else(|| anyhow!("p4 client -o returned nothing"))?;
    let client = record
        .text("Client")
        .ok_or_else(|| anyhow!("clientspec has no Client field"))?
        .into_owned();

    let marker = format!(" //{client}");
    let mut views: Vec<(String, String)> = Vec::new();
    for (key, value) in record.iter_text() {
        if !key.starts_with("View") || value.starts_with("-//") {
            continue;
        }
        // "//depot/dir //<client>/dir" → ("/depot/dir", "/dir"), dropping
        // one leading slash from each side.
        let Some((left, right)) = value.split_once(&marker) else {
            return Ok(false);
        };
        let left = left.strip_prefix('/').unwrap_or(left).to_owned();
        views.push((left, right.to_owned()));
    }
    let Some((first_left, first_right)) = views.first() else {
        bail!("clientspec has no View mappings");
    };
    // A (possibly empty) prefix taken from the first mapping; every mapping
    // must be prefix + depot-side.
    let prefix = first_right
        .get(..first_right.len().saturating_sub(first_left.len()))
        .unwrap_or("")
        .to_owned();
    Ok(views
        .iter()
        .all(|(left, right)| format!("{prefix}{left}") == *right))
}

/// Relative workspace paths of all files opened for edit under `depot_root`,
/// with their open action.
pub fn opened_files(depot_root: &str) -> Result<Vec<(String, String)>> {
    let records = Pyforce::run(["opened", &format!("{depot_root}/...")])?;
    let prefix_len = depot_root.len() + 1;
    let mut out = Vec::new();
    for record in records {
        let Some(depot_file) = record.text("depotFile") else {
            continue;
        };
        let path = o4_pyforce::unescape(&depot_file);
        if path.len() > prefix_len {
            out.push((
                path[prefix_len..].to_owned(),
                record.text("action").unwrap_or_default().into_owned(),
            ));
        }
    }
    Ok(out)
}
