//! Resumable HTTP download engine.
//!
//! A download to `<target>` keeps at most two transient companions:
//! `<target>.part` (the partial body) and `<target>.part.etag` (the source
//! ETag the partial was captured at). A completed download renames the
//! partial into place and removes the ETag file.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use reqwest::header::{ETAG, IF_MATCH, IF_NONE_MATCH, RANGE};
use reqwest::StatusCode;
use thiserror::Error;

use crate::error::AppError;

/// Outcome of a completed (or skipped) download.
#[derive(Debug)]
pub struct Download {
    /// Bytes fetched by this call; 0 when the If-None-Match hint matched.
    pub bytes: u64,
    /// ETag of the response, when the source supplied one.
    pub etag: Option<String>,
}

/// Download failure carrying the bytes fetched before the failure. Partial
/// state stays on disk for the next resume except where the protocol
/// requires a reset (stale or unreadable partial ETag).
#[derive(Debug, Error)]
#[error("{source}")]
pub struct DownloadError {
    pub bytes: u64,
    #[source]
    pub source: AppError,
}

impl DownloadError {
    fn new(source: impl Into<AppError>) -> Self {
        DownloadError {
            bytes: 0,
            source: source.into(),
        }
    }
}

fn protocol_error(message: impl Into<String>) -> DownloadError {
    DownloadError::new(AppError::Download(message.into()))
}

/// Fetch `request_url` into `download_path`, resuming any partial state.
///
/// Always sends `Range: bytes=<partial size>-`, plus `If-Match` with the
/// stored partial ETag or `If-None-Match` with the caller's hint when no
/// partial exists — never both. If-Range is avoided because not all
/// sources honor it.
///
/// Accepted responses: 206 and 416 finalize the download (416 means the
/// resume cursor is already past the end), 412 means the partial is stale
/// (both artifacts are deleted and the call fails; the caller retries from
/// scratch), 304 means the hint matched (artifacts deleted, 0 bytes). Any
/// other status is an error.
pub async fn resume_download(
    http_client: &reqwest::Client,
    request_url: &str,
    download_path: &Path,
    if_none_match_etag: Option<&str>,
) -> Result<Download, DownloadError> {
    let partial_path = companion_path(download_path, ".part");
    let partial_etag_path = companion_path(download_path, ".part.etag");

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&partial_path)
        .map_err(DownloadError::new)?;
    let partial_size = file.metadata().map_err(DownloadError::new)?.len();

    // A resumed partial must carry the ETag it was captured at; without it
    // the partial cannot be validated against the source, so reset and let
    // the caller retry clean.
    let mut partial_etag = None;
    if partial_size > 0 {
        match fs::read_to_string(&partial_etag_path) {
            Ok(etag) if !etag.is_empty() => partial_etag = Some(etag),
            _ => {
                drop(file);
                remove_partial_state(&partial_path, &partial_etag_path);
                return Err(protocol_error("failed to load partial download ETag"));
            }
        }
    }

    let mut request = http_client
        .get(request_url)
        .header(RANGE, format!("bytes={}-", partial_size));
    if let Some(etag) = &partial_etag {
        request = request.header(IF_MATCH, etag.as_str());
    } else if let Some(hint) = if_none_match_etag {
        request = request.header(IF_NONE_MATCH, hint);
    }

    let mut response = request.send().await.map_err(DownloadError::new)?;
    let status = response.status();
    if !matches!(
        status,
        StatusCode::PARTIAL_CONTENT
            | StatusCode::RANGE_NOT_SATISFIABLE
            | StatusCode::PRECONDITION_FAILED
            | StatusCode::NOT_MODIFIED
    ) {
        return Err(protocol_error(format!(
            "unexpected response status code: {}",
            status.as_u16()
        )));
    }

    let response_etag = response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    if status == StatusCode::PRECONDITION_FAILED {
        // The source object changed under the partial.
        drop(file);
        remove_partial_state(&partial_path, &partial_etag_path);
        return Err(protocol_error("partial download ETag mismatch"));
    }

    if status == StatusCode::NOT_MODIFIED {
        // Only possible in the If-None-Match case; the caller checks the
        // returned ETag against its hint.
        drop(file);
        remove_partial_state(&partial_path, &partial_etag_path);
        return Ok(Download {
            bytes: 0,
            etag: response_etag,
        });
    }

    // Not fatal: a missing ETag file only forces a restart on the next
    // resume.
    if let Some(etag) = &response_etag {
        let _ = fs::write(&partial_etag_path, etag);
    }

    // An interrupted copy leaves .part and .part.etag in place for resume.
    // Bytes are reported even on error so the caller can show partial
    // progress.
    let mut downloaded: u64 = 0;
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                if let Err(e) = write_synced(&mut file, &chunk) {
                    return Err(DownloadError {
                        bytes: downloaded,
                        source: e.into(),
                    });
                }
                downloaded += chunk.len() as u64;
            }
            Ok(None) => break,
            Err(e) => {
                return Err(DownloadError {
                    bytes: downloaded,
                    source: e.into(),
                })
            }
        }
    }

    if let Err(e) = file.sync_all() {
        return Err(DownloadError {
            bytes: downloaded,
            source: e.into(),
        });
    }
    drop(file);

    // Remove any previous artifact so the rename can land.
    let _ = fs::remove_file(download_path);
    if let Err(e) = fs::rename(&partial_path, download_path) {
        return Err(DownloadError {
            bytes: downloaded,
            source: e.into(),
        });
    }
    let _ = fs::remove_file(&partial_etag_path);

    Ok(Download {
        bytes: downloaded,
        etag: response_etag,
    })
}

fn companion_path(path: &Path, suffix: &str) -> PathBuf {
    let mut companion: OsString = path.as_os_str().to_os_string();
    companion.push(suffix);
    PathBuf::from(companion)
}

fn remove_partial_state(partial_path: &Path, partial_etag_path: &Path) {
    let _ = fs::remove_file(partial_path);
    let _ = fs::remove_file(partial_etag_path);
}

// Push each body chunk to disk so a crash leaves the on-disk partial
// consistent with the byte count already reported.
fn write_synced(file: &mut File, chunk: &[u8]) -> std::io::Result<()> {
    file.write_all(chunk)?;
    file.sync_data()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_body() -> Vec<u8> {
        (0..100_000u32).map(|i| (i % 251) as u8).collect()
    }

    /// Minimal range-capable HTTP source honoring If-Match and
    /// If-None-Match. Returns the base URL.
    async fn spawn_source(body: Vec<u8>, etag: &str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = Arc::new(body);
        let etag = etag.to_string();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let body = body.clone();
                let etag = etag.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut request = Vec::new();
                    loop {
                        let n = match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        request.extend_from_slice(&buf[..n]);
                        if request.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let request = String::from_utf8_lossy(&request).into_owned();
                    let header = |name: &str| -> Option<String> {
                        request.lines().find_map(|line| {
                            let (key, value) = line.split_once(':')?;
                            key.trim()
                                .eq_ignore_ascii_case(name)
                                .then(|| value.trim().to_string())
                        })
                    };

                    let range_start = header("Range")
                        .and_then(|r| {
                            let r = r.strip_prefix("bytes=")?.strip_suffix('-')?.to_string();
                            r.parse::<u64>().ok()
                        })
                        .unwrap_or(0);

                    if header("If-Match").is_some_and(|v| v != etag) {
                        let response = format!(
                            "HTTP/1.1 412 Precondition Failed\r\nETag: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                            etag
                        );
                        let _ = stream.write_all(response.as_bytes()).await;
                    } else if header("If-None-Match").is_some_and(|v| v == etag) {
                        let response = format!(
                            "HTTP/1.1 304 Not Modified\r\nETag: {}\r\nConnection: close\r\n\r\n",
                            etag
                        );
                        let _ = stream.write_all(response.as_bytes()).await;
                    } else if range_start >= body.len() as u64 {
                        let response = format!(
                            "HTTP/1.1 416 Range Not Satisfiable\r\nETag: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                            etag
                        );
                        let _ = stream.write_all(response.as_bytes()).await;
                    } else {
                        let tail = &body[range_start as usize..];
                        let mut response = format!(
                            "HTTP/1.1 206 Partial Content\r\nETag: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            etag,
                            tail.len()
                        )
                        .into_bytes();
                        response.extend_from_slice(tail);
                        let _ = stream.write_all(&response).await;
                    }
                    let _ = stream.shutdown().await;
                });
            }
        });

        format!("http://{}/artifact", addr)
    }

    #[tokio::test]
    async fn test_fresh_download() {
        let body = test_body();
        let url = spawn_source(body.clone(), "\"v1\"").await;
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("artifact.dat");

        let client = reqwest::Client::new();
        let result = resume_download(&client, &url, &target, None)
            .await
            .unwrap();

        assert_eq!(result.bytes, body.len() as u64);
        assert_eq!(result.etag.as_deref(), Some("\"v1\""));
        assert_eq!(fs::read(&target).unwrap(), body);
        assert!(!companion_path(&target, ".part").exists());
        assert!(!companion_path(&target, ".part.etag").exists());
    }

    #[tokio::test]
    async fn test_resume_produces_identical_file() {
        let body = test_body();
        let url = spawn_source(body.clone(), "\"v1\"").await;
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("artifact.dat");

        // Interrupted earlier run: 30000 bytes on disk plus the ETag.
        fs::write(companion_path(&target, ".part"), &body[..30_000]).unwrap();
        fs::write(companion_path(&target, ".part.etag"), "\"v1\"").unwrap();

        let client = reqwest::Client::new();
        let result = resume_download(&client, &url, &target, None)
            .await
            .unwrap();

        assert_eq!(result.bytes, (body.len() - 30_000) as u64);
        assert_eq!(fs::read(&target).unwrap(), body);
        assert!(!companion_path(&target, ".part").exists());
        assert!(!companion_path(&target, ".part.etag").exists());
    }

    #[tokio::test]
    async fn test_stale_partial_etag_resets() {
        let body = test_body();
        let url = spawn_source(body.clone(), "\"v2\"").await;
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("artifact.dat");

        fs::write(companion_path(&target, ".part"), &body[..10_000]).unwrap();
        fs::write(companion_path(&target, ".part.etag"), "\"v1\"").unwrap();

        let client = reqwest::Client::new();
        let err = resume_download(&client, &url, &target, None)
            .await
            .unwrap_err();

        assert!(
            err.to_string().contains("ETag mismatch"),
            "error: {}",
            err
        );
        assert!(!target.exists());
        assert!(!companion_path(&target, ".part").exists());
        assert!(!companion_path(&target, ".part.etag").exists());
    }

    #[tokio::test]
    async fn test_if_none_match_hint_skips_download() {
        let body = test_body();
        let url = spawn_source(body, "\"v1\"").await;
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("artifact.dat");

        let client = reqwest::Client::new();
        let result = resume_download(&client, &url, &target, Some("\"v1\""))
            .await
            .unwrap();

        assert_eq!(result.bytes, 0);
        assert_eq!(result.etag.as_deref(), Some("\"v1\""));
        assert!(!target.exists());
        assert!(!companion_path(&target, ".part").exists());
    }

    #[tokio::test]
    async fn test_over_requested_range_finalizes() {
        let body = test_body();
        let url = spawn_source(body.clone(), "\"v1\"").await;
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("artifact.dat");

        // The whole body already sits in the partial; the range request
        // starts past the end and the source answers 416.
        fs::write(companion_path(&target, ".part"), &body).unwrap();
        fs::write(companion_path(&target, ".part.etag"), "\"v1\"").unwrap();

        let client = reqwest::Client::new();
        let result = resume_download(&client, &url, &target, None)
            .await
            .unwrap();

        assert_eq!(result.bytes, 0);
        assert_eq!(fs::read(&target).unwrap(), body);
        assert!(!companion_path(&target, ".part").exists());
        assert!(!companion_path(&target, ".part.etag").exists());
    }

    #[tokio::test]
    async fn test_partial_without_etag_resets() {
        let body = test_body();
        let url = spawn_source(body.clone(), "\"v1\"").await;
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("artifact.dat");

        fs::write(companion_path(&target, ".part"), &body[..5_000]).unwrap();

        let client = reqwest::Client::new();
        let err = resume_download(&client, &url, &target, None)
            .await
            .unwrap_err();

        assert!(
            err.to_string().contains("failed to load partial download ETag"),
            "error: {}",
            err
        );
        assert!(!companion_path(&target, ".part").exists());
    }
}
