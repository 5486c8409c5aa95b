use crate::errors::LayerError;
use reqwest::{header, redirect, StatusCode};
use sha2::{Digest, Sha256};
use std::{path::Path, time::Duration};
use tokio::{fs::File, io::AsyncWriteExt};
use url::Url;

/// Longest redirect chain we will follow
pub const MAX_REDIRECTS: usize = 5;

/// Streams layer archives to local files
///
/// Redirects are followed by hand so each `Location` is visible in the log;
/// release hosting usually bounces through a CDN or two.
#[derive(Clone, Debug)]
pub struct Downloader {
    req: reqwest::Client,
}

impl Downloader {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, LayerError> {
        let req = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Downloader { req })
    }

    /// Download `url` into `dest`, calling `progress` with the fraction
    /// received after every chunk
    ///
    /// The fraction is measured against `Content-Length` when the server sends
    /// one, otherwise against `expected_size`. When `sha256` is given the
    /// content is verified before returning. On error the partial file is
    /// left for the caller to remove.
    pub async fn download<F>(
        &self,
        url: &str,
        dest: &Path,
        expected_size: u64,
        sha256: Option<&str>,
        mut progress: F,
    ) -> Result<u64, LayerError>
    where
        F: FnMut(f64),
    {
        let mut response = self.follow_redirects(url).await?;
        let total = response
            .content_length()
            .filter(|len| *len > 0)
            .unwrap_or(expected_size);
        log::info!("<{}> downloading {} bytes ...", response.url(), total);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LayerError::from_io(e, parent))?;
        }
        let mut file = File::create(dest)
            .await
            .map_err(|e| LayerError::from_io(e, dest))?;
        let mut hasher = Sha256::new();
        let mut received: u64 = 0;

        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk)
                .await
                .map_err(|e| LayerError::from_io(e, dest))?;
            hasher.update(&chunk);
            received += chunk.len() as u64;
            progress(fraction(received, total));
        }
        file.flush().await.map_err(|e| LayerError::from_io(e, dest))?;
        progress(1.0);
        log::debug!("{:?} downloaded, {} bytes", dest, received);

        if let Some(expected) = sha256 {
            let found = to_hex(&hasher.finalize());
            if !found.eq_ignore_ascii_case(expected) {
                return Err(LayerError::ContentDigestMismatch {
                    expected: expected.to_string(),
                    found,
                });
            }
        }
        Ok(received)
    }

    async fn follow_redirects(&self, url: &str) -> Result<reqwest::Response, LayerError> {
        let mut current = Url::parse(url)?;
        for _ in 0..=MAX_REDIRECTS {
            let response = self.req.get(current.clone()).send().await?;
            let status = response.status();
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| LayerError::MissingRedirectLocation(current.to_string()))?;
                let next = current.join(location)?;
                log::debug!("redirect {} -> {}", current, next);
                current = next;
                continue;
            }
            if status != StatusCode::OK {
                return Err(LayerError::HttpStatus {
                    url: current.to_string(),
                    status: status.as_u16(),
                });
            }
            return Ok(response);
        }
        Err(LayerError::TooManyRedirects(url.to_string()))
    }
}

fn fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (done as f64 / total as f64).min(1.0)
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
