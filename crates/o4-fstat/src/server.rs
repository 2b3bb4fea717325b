//! Client for the optional remote fstat service.
//!
//! The service mirrors the `.o4` cache over HTTP:
//! `GET <base>/o4-http/fstat/<cl>/<depot-without-slashes>?nearby=<n>`
//! returns a gzipped fstat stream for `<cl>`, or a 3xx redirect to the
//! nearest changelist it already has (within `nearby`). The body is
//! consumed streamingly — a redirect costs nothing.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::time::Duration;

use flate2::read::MultiGzDecoder;
use tracing::{debug, warn};

use crate::error::FstatError;

/// Connection settings, resolved from the o4 config file.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Base URL, e.g. `https://o4.example.com`.
    pub url: String,
    /// Redirect tolerance: the server may answer with any cached changelist
    /// within this many changes below the requested one.
    pub nearby: u64,
    /// Basic-auth credentials.
    pub auth: Option<(String, String)>,
    /// Extra PEM root certificate, if the server is privately signed.
    pub cert: Option<PathBuf>,
}

/// Result of one fstat fetch.
pub enum FetchOutcome {
    /// 200: the decompressed record stream.
    Stream(Box<dyn BufRead + Send>),
    /// 3xx: the server offers this changelist instead.
    Redirect(u64),
    /// The service did not produce a usable answer; fall back to Perforce.
    Unavailable(String),
}

pub struct FstatServer {
    config: ServerConfig,
}

impl FstatServer {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn nearby(&self) -> u64 {
        self.config.nearby
    }

    fn client(&self) -> Result<reqwest::blocking::Client, FstatError> {
        let mut builder = reqwest::blocking::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10));
        if let Some(cert_path) = &self.config.cert {
            let pem = fs::read(cert_path)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| FstatError::Server(format!("bad certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        builder
            .build()
            .map_err(|e| FstatError::Server(format!("client setup: {e}")))
    }

    /// Fetch the fstat stream for `depot_path` at `cl`.
    ///
    /// Network and protocol problems come back as
    /// [`FetchOutcome::Unavailable`] so the caller can fall back to Perforce;
    /// only local misconfiguration (an unreadable certificate) is an error.
    pub fn fetch(&self, depot_path: &str, cl: u64) -> Result<FetchOutcome, FstatError> {
        let depot = depot_path
            .trim_start_matches('/')
            .trim_end_matches("/...")
            .trim_end_matches('/');
        let url = format!(
            "{}/o4-http/fstat/{}/{}?nearby={}",
            self.config.url.trim_end_matches('/'),
            cl,
            depot,
            self.config.nearby
        );
        debug!(%url, "fstat server request");

        let mut request = self.client()?.get(&url);
        if let Some((user, password)) = &self.config.auth {
            request = request.basic_auth(user, Some(password));
        }
        let response = match request.send() {
            Ok(r) => r,
            Err(e) => return Ok(FetchOutcome::Unavailable(e.to_string())),
        };

        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            return Ok(match redirect_changelist(location) {
                Some(redir_cl) => FetchOutcome::Redirect(redir_cl),
                None => {
                    warn!(%location, "fstat server redirect without a changelist");
                    FetchOutcome::Unavailable(format!("bad redirect: {location}"))
                }
            });
        }
        if !status.is_success() {
            return Ok(FetchOutcome::Unavailable(format!("HTTP {status}")));
        }
        Ok(FetchOutcome::Stream(Box::new(BufReader::new(
            MultiGzDecoder::new(response),
        ))))
    }
}

/// Pull the changelist out of a redirect location like
/// `/o4-http/fstat/12345/depot/app`.
fn redirect_changelist(location: &str) -> Option<u64> {
    let path = location.split('?').next().unwrap_or(location);
    let mut segments = path.split('/');
    segments
        .by_ref()
        .find(|s| *s == "fstat")
        .and_then(|_| segments.next())
        .and_then(|cl| cl.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_parsing() {
        assert_eq!(
            redirect_changelist("/o4-http/fstat/999/depot/app"),
            Some(999)
        );
        assert_eq!(
            redirect_changelist("https://host/o4-http/fstat/42/d?nearby=5"),
            Some(42)
        );
        assert_eq!(redirect_changelist("/somewhere/else"), None);
    }
}
