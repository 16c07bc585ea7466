//! Streaming file downloads through the shared request policy.
//!
//! Bodies are streamed to disk rather than buffered; a failed stream removes
//! the partial file so reruns start clean. Bulk downloads run strictly one
//! at a time - the point of this tool is politeness, not throughput - and a
//! rate-limit block on one file short-circuits the rest of the batch.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, error, info, instrument, warn};

use crate::request::{ApiClient, ApiError};

/// Errors from a single file download.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The destination file already exists and overwriting was not requested.
    #[error("destination already exists (pass overwrite to replace): {path}")]
    AlreadyExists {
        /// The occupied destination path.
        path: PathBuf,
    },

    /// The request failed.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Writing the file failed.
    #[error("IO error writing {path}: {source}")]
    Io {
        /// The destination path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// One (source URL, destination path) pair for a bulk download.
///
/// `dest` is `None` when no local path could be derived from the URL; such
/// jobs are reported as skipped.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    /// Source URL.
    pub src: String,
    /// Destination path, when one could be derived.
    pub dest: Option<PathBuf>,
}

/// One line of a [`DownloadReport`].
#[derive(Debug, Clone)]
pub struct DownloadRecord {
    /// Source URL.
    pub src: String,
    /// Destination path, when one was known.
    pub dest: Option<PathBuf>,
}

/// Result of a bulk download: which URLs landed on disk and which did not.
#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    /// Successfully downloaded files.
    pub downloaded: Vec<DownloadRecord>,
    /// Files skipped for any reason (no destination, request error, existing
    /// file, blocked session).
    pub skipped: Vec<DownloadRecord>,
}

impl DownloadReport {
    /// Records a successful download.
    pub fn record_downloaded(&mut self, src: &str, dest: &Path) {
        self.downloaded.push(DownloadRecord {
            src: src.to_string(),
            dest: Some(dest.to_path_buf()),
        });
    }

    /// Records a skipped file.
    pub fn record_skipped(&mut self, src: &str, dest: Option<&Path>) {
        self.skipped.push(DownloadRecord {
            src: src.to_string(),
            dest: dest.map(Path::to_path_buf),
        });
    }
}

/// Downloads one file to `dest`, streaming the body to disk.
///
/// Parent directories are created as needed. Existing destinations are left
/// alone unless `overwrite` is set. On a stream error the partial file is
/// removed.
///
/// # Errors
///
/// Returns [`FetchError`] when the destination is occupied, the request
/// fails, or the file cannot be written.
#[instrument(skip(client), fields(url = %url, dest = %dest.display()))]
pub async fn download_file(
    client: &ApiClient,
    url: &str,
    dest: &Path,
    overwrite: bool,
) -> Result<(), FetchError> {
    if dest.is_file() && !overwrite {
        return Err(FetchError::AlreadyExists {
            path: dest.to_path_buf(),
        });
    }

    let response = client.get_response(url).await?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| FetchError::Io {
                path: dest.to_path_buf(),
                source,
            })?;
    }

    let file = File::create(dest).await.map_err(|source| FetchError::Io {
        path: dest.to_path_buf(),
        source,
    })?;

    match stream_to_file(file, response, url, dest).await {
        Ok(bytes) => {
            info!(bytes, "file downloaded");
            Ok(())
        }
        Err(e) => {
            debug!(path = %dest.display(), "removing partial file after stream error");
            let _ = tokio::fs::remove_file(dest).await;
            Err(e)
        }
    }
}

/// Downloads a batch of jobs sequentially.
///
/// Each job goes through the client's retry policy. Failures are logged and
/// reported as skipped; once the session is blocked by a 429 the remaining
/// jobs short-circuit without network traffic and land in the skipped list.
#[instrument(skip(client, jobs), fields(jobs = jobs.len()))]
pub async fn download_jobs(
    client: &ApiClient,
    jobs: &[DownloadJob],
    overwrite: bool,
) -> DownloadReport {
    let mut report = DownloadReport::default();

    for job in jobs {
        let Some(dest) = job.dest.as_deref() else {
            error!(src = %job.src, "no destination path could be derived; skipping");
            report.record_skipped(&job.src, None);
            continue;
        };

        match download_file(client, &job.src, dest, overwrite).await {
            Ok(()) => report.record_downloaded(&job.src, dest),
            Err(e) => {
                warn!(src = %job.src, error = %e, "skipping file");
                report.record_skipped(&job.src, Some(dest));
            }
        }
    }

    info!(
        downloaded = report.downloaded.len(),
        skipped = report.skipped.len(),
        "bulk download finished"
    );
    report
}

/// Streams a response body to an open file, returning bytes written.
async fn stream_to_file(
    file: File,
    response: reqwest::Response,
    url: &str,
    dest: &Path,
) -> Result<u64, FetchError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FetchError::Api(ApiError::network(url, e)))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|source| FetchError::Io {
                path: dest.to_path_buf(),
                source,
            })?;
        bytes_written += chunk.len() as u64;
    }

    writer.flush().await.map_err(|source| FetchError::Io {
        path: dest.to_path_buf(),
        source,
    })?;

    Ok(bytes_written)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::request::ClientOptions;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_client() -> ApiClient {
        ApiClient::with_options(&ClientOptions {
            user_agent: None,
            pause: Duration::ZERO,
            max_attempts: 2,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_download_file_writes_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage-services/public/a.jp2"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"image bytes".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("files/public-a.jp2");
        let client = fast_client();
        let url = format!("{}/storage-services/public/a.jp2", server.uri());

        download_file(&client, &url, &dest, false).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"image bytes");
    }

    #[test]
    fn test_download_file_refuses_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("existing.jp2");
        std::fs::write(&dest, b"old").unwrap();

        // No request is made; the guard fires before any network access.
        let client = fast_client();
        let result =
            tokio_test::block_on(download_file(&client, "https://unused.example/", &dest, false));
        assert!(matches!(result, Err(FetchError::AlreadyExists { .. })));
        // untouched
        assert_eq!(std::fs::read(&dest).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_download_file_overwrites_when_asked() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/f"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"new".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("f.bin");
        std::fs::write(&dest, b"old").unwrap();

        let client = fast_client();
        let url = format!("{}/f", server.uri());
        download_file(&client, &url, &dest, true).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_download_file_404_leaves_no_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing.bin");
        let client = fast_client();
        let url = format!("{}/missing", server.uri());

        let result = download_file(&client, &url, &dest, false).await;
        assert!(matches!(
            result,
            Err(FetchError::Api(ApiError::NotFound { .. }))
        ));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_download_jobs_reports_and_continues() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/good"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bad"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = fast_client();
        let jobs = vec![
            DownloadJob {
                src: format!("{}/good", server.uri()),
                dest: Some(dir.path().join("good.bin")),
            },
            DownloadJob {
                src: format!("{}/bad", server.uri()),
                dest: Some(dir.path().join("bad.bin")),
            },
            DownloadJob {
                src: "https://tile.loc.gov/unparseable".to_string(),
                dest: None,
            },
        ];

        let report = download_jobs(&client, &jobs, false).await;
        assert_eq!(report.downloaded.len(), 1);
        assert_eq!(report.skipped.len(), 2);
        assert!(dir.path().join("good.bin").exists());
        assert!(!dir.path().join("bad.bin").exists());
    }

    #[tokio::test]
    async fn test_download_jobs_blocked_session_skips_remainder() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/first"))
            .respond_with(ResponseTemplate::new(429))
            .expect(1)
            .mount(&server)
            .await;
        // The second URL must never be requested once the session is blocked.
        Mock::given(method("GET"))
            .and(path("/second"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = fast_client();
        let jobs = vec![
            DownloadJob {
                src: format!("{}/first", server.uri()),
                dest: Some(dir.path().join("first.bin")),
            },
            DownloadJob {
                src: format!("{}/second", server.uri()),
                dest: Some(dir.path().join("second.bin")),
            },
        ];

        let report = download_jobs(&client, &jobs, false).await;
        assert!(report.downloaded.is_empty());
        assert_eq!(report.skipped.len(), 2);
        assert!(client.is_blocked());
    }
}
