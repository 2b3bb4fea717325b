//! The o4 configuration file.
//!
//! A flat `key = value` line format (a de-facto wire format shared with the
//! other o4 deployments, so it is parsed as-is rather than re-modeled):
//! `#` comments and blank lines are ignored, lines without `=` are warned
//! about and skipped, later files and later lines win, and values may
//! reference other keys as `${key}`.
//!
//! Sources, in order: `$O4CONFIG` (or `~/o4.config` when unset), then
//! `$BLT_HOME/config.blt` appended.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use o4_fstat::server::ServerConfig;
use tracing::warn;

// The server redirects to an existing fstat file within this many changes
// of the request rather than creating a new one. A sparser submitted-CL
// sequence wants a larger value.
const DEFAULT_NEARBY: u64 = 5000;

#[derive(Clone, Debug, Default)]
pub struct O4Config {
    props: BTreeMap<String, String>,
}

impl O4Config {
    /// Load from the standard locations. Missing files are fine; unreadable
    /// ones only cost a warning.
    pub fn load() -> Self {
        let mut config = Self::default();
        match std::env::var_os("O4CONFIG") {
            Some(path) => config.read_file(Path::new(&path)),
            None => {
                if let Some(home) = std::env::var_os("HOME") {
                    let path = PathBuf::from(home).join("o4.config");
                    if path.exists() {
                        config.read_file(&path);
                    }
                }
            }
        }
        if let Some(blt) = std::env::var_os("BLT_HOME") {
            let path = PathBuf::from(blt).join("config.blt");
            if path.exists() {
                config.read_file(&path);
            }
        }
        config
    }

    pub fn from_lines(content: &str, origin: &str) -> Self {
        let mut config = Self::default();
        config.parse(content, origin);
        config
    }

    fn read_file(&mut self, path: &Path) {
        match std::fs::read_to_string(path) {
            Ok(content) => self.parse(&content, &path.display().to_string()),
            Err(e) => warn!(file = %path.display(), "could not read o4 configuration: {e}"),
        }
    }

    fn parse(&mut self, content: &str, origin: &str) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) => {
                    self.props
                        .insert(key.trim().to_owned(), value.trim().to_owned());
                }
                None => warn!(file = %origin, "ignoring configuration line: {line}"),
            }
        }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    /// Resolve `${key}` references against the loaded properties.
    fn expand(&self, value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            match rest[start + 2..].find('}') {
                Some(end) => {
                    let key = &rest[start + 2..start + 2 + end];
                    match self.get(key) {
                        Some(v) => out.push_str(v),
                        None => warn!(key, "configuration variable not found"),
                    }
                    rest = &rest[start + 2 + end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// Remote fstat service settings, unless disabled (`$NOO4SERVER`) or
    /// unconfigured.
    pub fn fstat_server(&self) -> Option<ServerConfig> {
        if std::env::var_os("NOO4SERVER").is_some() {
            return None;
        }
        let url = self.get("o4.fstat_server_url")?.to_owned();
        let nearby = self
            .get("o4.fstat_server.nearby")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_NEARBY);
        let auth = self.fstat_server_auth();
        let cert = match self.get("o4.fstat_server_cert") {
            None | Some("") | Some("none") => None,
            Some(path) => {
                let path = PathBuf::from(self.expand(path));
                if path.exists() {
                    Some(path)
                } else {
                    warn!(cert = %path.display(), "fstat server certificate file does not exist");
                    None
                }
            }
        };
        Some(ServerConfig {
            url,
            nearby,
            auth,
            cert,
        })
    }

    fn fstat_server_auth(&self) -> Option<(String, String)> {
        let spec = self.get("o4.fstat_server_auth")?;
        let mut parts = spec.splitn(3, ':');
        let method = parts.next().unwrap_or("");
        let user = self.expand(parts.next()?);
        let password = self.expand(parts.next()?);
        match method {
            "basic" => Some((user, password)),
            "digest" => {
                warn!("digest auth for the fstat server is not supported; sending no credentials");
                None
            }
            other => {
                warn!(method = other, "unknown fstat server auth method");
                None
            }
        }
    }

    pub fn allow_nonflat_clientspec(&self) -> bool {
        match self.get("o4.allow_nonflat_clientspec") {
            Some(v) => v == "true",
            // A development edition of the surrounding toolchain implies
            // hand-maintained clientspecs.
            None => self.get("blt.edition.dev") == Some("false"),
        }
    }

    /// Per-directory cache ceiling, e.g. `o4.cache.maximum_dir_size = 2g`.
    pub fn maximum_dir_size(&self) -> Option<u64> {
        scaled_int(self.get("o4.cache.maximum_dir_size")?)
    }

    /// Free-space floor for shared cache hosts, e.g. `5g`.
    pub fn minimum_disk_free(&self) -> Option<u64> {
        scaled_int(self.get("o4.cache.minimum_disk_free")?)
    }

    /// Extra default arguments for a subcommand: `o4.args.<cmd>` then
    /// `o4.args`, injected right after the subcommand word.
    pub fn cmdline_args(&self, subcommand: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(spec) = self.get(&format!("o4.args.{subcommand}")) {
            args.extend(split_args(spec));
        }
        if let Some(spec) = self.get("o4.args") {
            args.extend(split_args(spec));
        }
        args
    }
}

/// `<n>[k|m|g]` byte counts.
fn scaled_int(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(n) = value.parse::<u64>() {
        return Some(n);
    }
    let (num, scale) = value.split_at(value.len() - 1);
    let factor: u64 = match scale {
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        _ => return None,
    };
    num.trim().parse::<u64>().ok().map(|n| n * factor)
}

/// Whitespace splitting with simple single/double quoting.
fn split_args(spec: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in spec.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => quote = Some(c),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        args.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_interpolates() {
        let config = O4Config::from_lines(
            "# comment\n\
             token.id = alice\n\
             token.hash = s3cret\n\
             o4.fstat_server_url = https://o4.example.com\n\
             o4.fstat_server_auth = basic:${token.id}:${token.hash}\n\
             o4.fstat_server.nearby = 100\n\
             not a setting\n",
            "test",
        );
        let server = config.fstat_server().unwrap();
        assert_eq!(server.url, "https://o4.example.com");
        assert_eq!(server.nearby, 100);
        assert_eq!(server.auth, Some(("alice".to_owned(), "s3cret".to_owned())));
    }

    #[test]
    fn digest_auth_downgrades_to_none() {
        let config = O4Config::from_lines(
            "o4.fstat_server_url = https://x\n\
             o4.fstat_server_auth = digest:u:p\n",
            "test",
        );
        assert_eq!(config.fstat_server().unwrap().auth, None);
    }

    #[test]
    fn scaled_sizes() {
        assert_eq!(scaled_int("123"), Some(123));
        assert_eq!(scaled_int("2k"), Some(2048));
        assert_eq!(scaled_int("3m"), Some(3 * 1024 * 1024));
        assert_eq!(scaled_int("5g"), Some(5 << 30));
        assert_eq!(scaled_int("5x"), None);
        assert_eq!(scaled_int(""), None);
    }

    #[test]
    fn cmdline_args_specific_then_general() {
        let config =
            O4Config::from_lines("o4.args.sync = -q\no4.args = -v 'two words'\n", "test");
        assert_eq!(config.cmdline_args("sync"), vec!["-q", "-v", "two words"]);
        assert_eq!(config.cmdline_args("status"), vec!["-v", "two words"]);
    }

    #[test]
    fn nonflat_clientspec_flag() {
        let yes = O4Config::from_lines("o4.allow_nonflat_clientspec = true\n", "t");
        assert!(yes.allow_nonflat_clientspec());
        let no = O4Config::from_lines("", "t");
        assert!(!no.allow_nonflat_clientspec());
    }
}
