//! On-demand download of single loose objects from the object server.

use std::fs;
use std::io::{self, ErrorKind, Read, Write};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use objkeep_domain::{Enlistment, ObjectId};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use url::Url;

use super::negative_cache::NegativeCache;
use super::retry::{CallbackResult, CancellationToken, InvocationResult, RetryExecutor};
use crate::core::config::NetworkConfig;

pub const LOOSE_OBJECT_CONTENT_TYPE: &str = "application/x-git-loose-object";
const USER_AGENT: &str = concat!("objkeep/", env!("CARGO_PKG_VERSION"));
const COPY_BUFFER_BYTES: usize = 64 * 1024;

/// Who asked for the object. Git itself only asks when its copy is unreadable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestSource {
    FileAccess,
    GitSubprocess,
    Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FetchOutcome {
    Stored { path: String, bytes: u64 },
    AlreadyPresent { path: String },
    ObjectNotOnServer,
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("refusing to download the null object id")]
    NullObjectId,
    #[error("download of {id} was cancelled")]
    Cancelled { id: String },
    #[error("object server answered {status} for {url}")]
    Status { status: u16, url: String },
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("malformed response for {url}: {reason}")]
    Malformed { url: String, reason: String },
    #[error("failed to store object at {path}")]
    Store {
        path: String,
        #[source]
        source: io::Error,
    },
}

enum Attempted {
    Written(u64),
    AlreadyPresent,
    NotFound,
}

enum StreamError {
    Read(io::Error),
    Write(io::Error),
}

pub struct ObjectDownloader {
    enlistment: Enlistment,
    base_url: Url,
    client: Client,
    retry: RetryExecutor<DownloadError>,
    negative_cache: NegativeCache,
}

impl ObjectDownloader {
    /// # Errors
    /// Returns an error when no object server is configured or the HTTP client
    /// cannot be built.
    pub fn new(enlistment: Enlistment, network: &NetworkConfig) -> Result<Self> {
        let base_url = enlistment
            .object_server_url()
            .cloned()
            .ok_or_else(|| anyhow!("no object server configured; set OBJKEEP_REPO_URL"))?;
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(network.http_timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            enlistment,
            base_url,
            client,
            retry: RetryExecutor::new(network.retry_attempts).log_failures("ObjectDownloader"),
            negative_cache: NegativeCache::default(),
        })
    }

    #[must_use]
    pub fn with_negative_cache_ttl(mut self, ttl: Duration) -> Self {
        self.negative_cache = NegativeCache::new(ttl);
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry = self.retry.with_backoff(initial, max);
        self
    }

    /// `cancel` belongs to this call only; firing it aborts the pending
    /// retries of this fetch and leaves the downloader usable.
    ///
    /// # Errors
    /// Returns the terminal download failure, or `Cancelled` when `cancel`
    /// fired.
    pub fn fetch_and_store(
        &self,
        id: &ObjectId,
        source: RequestSource,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, DownloadError> {
        let mut buffer = vec![0u8; COPY_BUFFER_BYTES];
        self.fetch_with_buffer(id, source, cancel, &mut buffer)
    }

    /// Fetch several objects reusing one copy buffer. Failures are per id.
    pub fn fetch_and_store_batch(
        &self,
        ids: &[ObjectId],
        source: RequestSource,
        cancel: &CancellationToken,
    ) -> Vec<(ObjectId, Result<FetchOutcome, DownloadError>)> {
        let mut buffer = vec![0u8; COPY_BUFFER_BYTES];
        ids.iter()
            .map(|id| {
                let result = self.fetch_with_buffer(id, source, cancel, &mut buffer);
                (id.clone(), result)
            })
            .collect()
    }

    fn fetch_with_buffer(
        &self,
        id: &ObjectId,
        source: RequestSource,
        cancel: &CancellationToken,
        buffer: &mut [u8],
    ) -> Result<FetchOutcome, DownloadError> {
        if id.is_null() {
            return Err(DownloadError::NullObjectId);
        }
        if self.negative_cache.is_known_missing(id.as_str()) {
            debug!(object = %id, "object recently reported missing; skipping request");
            return Ok(FetchOutcome::ObjectNotOnServer);
        }

        let path = self.enlistment.loose_object_path(id);
        // git only asks again for an object it already has when that copy is corrupt
        let overwrite = source == RequestSource::GitSubprocess;
        if !overwrite && path.is_file() {
            return Ok(FetchOutcome::AlreadyPresent {
                path: path.to_string(),
            });
        }

        let url = self.object_url(id)?;
        let result = self.retry.invoke(cancel, |_| {
            self.attempt(&url, &path, overwrite, &mut *buffer)
        });
        match result {
            InvocationResult::Succeeded {
                value: Attempted::NotFound,
                ..
            } => {
                self.negative_cache.record_missing(id.as_str());
                debug!(object = %id, "object not on server");
                Ok(FetchOutcome::ObjectNotOnServer)
            }
            InvocationResult::Succeeded {
                value: Attempted::Written(bytes),
                attempts,
            } => {
                debug!(object = %id, bytes, attempts, ?source, "stored loose object");
                Ok(FetchOutcome::Stored {
                    path: path.to_string(),
                    bytes,
                })
            }
            InvocationResult::Succeeded {
                value: Attempted::AlreadyPresent,
                ..
            } => Ok(FetchOutcome::AlreadyPresent {
                path: path.to_string(),
            }),
            InvocationResult::Failed { attempts, error } => {
                warn!(object = %id, attempts, error = %error, "object download failed");
                Err(error)
            }
            InvocationResult::Cancelled { .. } => Err(DownloadError::Cancelled {
                id: id.to_string(),
            }),
        }
    }

    fn object_url(&self, id: &ObjectId) -> Result<Url, DownloadError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| DownloadError::Malformed {
                url: self.base_url.to_string(),
                reason: "object server URL cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .push("objects")
            .push(id.as_str());
        Ok(url)
    }

    fn attempt(
        &self,
        url: &Url,
        path: &Utf8Path,
        overwrite: bool,
        buffer: &mut [u8],
    ) -> CallbackResult<Attempted, DownloadError> {
        let response = match self
            .client
            .get(url.clone())
            .header(ACCEPT, LOOSE_OBJECT_CONTENT_TYPE)
            .send()
        {
            Ok(response) => response,
            Err(err) => {
                return CallbackResult::retryable(DownloadError::Transport {
                    url: url.to_string(),
                    message: err.to_string(),
                })
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return CallbackResult::Success(Attempted::NotFound);
        }
        if !status.is_success() {
            let error = DownloadError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            };
            return if is_retryable_status(status) {
                CallbackResult::retryable(error)
            } else {
                CallbackResult::fatal(error)
            };
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let media_type = content_type.split(';').next().unwrap_or_default().trim();
        if !media_type.eq_ignore_ascii_case(LOOSE_OBJECT_CONTENT_TYPE) {
            return CallbackResult::fatal(DownloadError::Malformed {
                url: url.to_string(),
                reason: format!("unexpected content type '{content_type}'"),
            });
        }

        match write_loose_object(response, path, overwrite, buffer) {
            Ok(attempted) => CallbackResult::Success(attempted),
            Err(StreamError::Read(err)) => CallbackResult::retryable(DownloadError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            }),
            Err(StreamError::Write(source)) => CallbackResult::fatal(DownloadError::Store {
                path: path.to_string(),
                source,
            }),
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn write_loose_object(
    mut body: impl Read,
    path: &Utf8Path,
    overwrite: bool,
    buffer: &mut [u8],
) -> Result<Attempted, StreamError> {
    let parent = path
        .parent()
        .ok_or_else(|| StreamError::Write(io::Error::new(ErrorKind::InvalidInput, "object path has no parent")))?;
    fs::create_dir_all(parent).map_err(StreamError::Write)?;
    let mut tmp = NamedTempFile::new_in(parent).map_err(StreamError::Write)?;
    let mut written = 0u64;
    loop {
        let read = match body.read(buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(StreamError::Read(err)),
        };
        tmp.write_all(&buffer[..read]).map_err(StreamError::Write)?;
        written += read as u64;
    }
    tmp.flush().map_err(StreamError::Write)?;

    if overwrite {
        tmp.persist(path).map_err(|err| StreamError::Write(err.error))?;
    } else {
        match tmp.persist_noclobber(path) {
            Ok(_) => {}
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => {
                return Ok(Attempted::AlreadyPresent)
            }
            Err(err) => return Err(StreamError::Write(err.error)),
        }
    }
    Ok(Attempted::Written(written))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::{matchers::request, responders::status_code, Expectation, Server};
    use tempfile::tempdir;

    const ID: &str = "5d7b5e6b1f0c1a7e9b3bf2d36c4c1ad1e2f3a4b5";
    const OBJECT_PATH: &str = "/repo/objects/5d7b5e6b1f0c1a7e9b3bf2d36c4c1ad1e2f3a4b5";
    const OTHER_ID: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const OTHER_PATH: &str = "/repo/objects/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn network(attempts: u32) -> NetworkConfig {
        NetworkConfig {
            repo_url: None,
            cache_server_url: None,
            retry_attempts: attempts,
            http_timeout: Duration::from_secs(5),
        }
    }

    fn downloader(server: &Server, root: &std::path::Path, attempts: u32) -> Result<ObjectDownloader> {
        let base = Url::parse(&server.url_str("/repo"))?;
        let enlistment = Enlistment::from_path(root)?.with_repo_url(Some(base));
        Ok(ObjectDownloader::new(enlistment, &network(attempts))?
            .with_backoff(Duration::from_millis(1), Duration::from_millis(5)))
    }

    fn never() -> CancellationToken {
        CancellationToken::new()
    }

    fn loose_object_reply() -> impl httptest::responders::Responder {
        status_code(200)
            .insert_header("Content-Type", LOOSE_OBJECT_CONTENT_TYPE)
            .body("compressed-object")
    }

    #[test]
    fn stores_object_in_fanout_directory() -> Result<()> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", OBJECT_PATH))
                .respond_with(loose_object_reply()),
        );
        let temp = tempdir()?;
        let downloader = downloader(&server, temp.path(), 3)?;
        let id = ObjectId::parse(ID)?;

        let outcome = downloader.fetch_and_store(&id, RequestSource::FileAccess, &never())?;
        let expected = temp.path().join(".git/objects/5d").join(&ID[2..]);
        assert_eq!(
            outcome,
            FetchOutcome::Stored {
                path: expected.display().to_string(),
                bytes: 17
            }
        );
        assert_eq!(fs::read_to_string(expected)?, "compressed-object");
        Ok(())
    }

    #[test]
    fn uppercase_id_lands_in_lowercase_fanout() -> Result<()> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", OBJECT_PATH))
                .times(1)
                .respond_with(loose_object_reply()),
        );
        let temp = tempdir()?;
        let downloader = downloader(&server, temp.path(), 3)?;
        let id = ObjectId::parse(&ID.to_ascii_uppercase())?;

        downloader.fetch_and_store(&id, RequestSource::FileAccess, &never())?;
        let fanout: Vec<String> = fs::read_dir(temp.path().join(".git/objects"))?
            .map(|entry| entry.map(|entry| entry.file_name().to_string_lossy().into_owned()))
            .collect::<io::Result<_>>()?;
        assert_eq!(fanout, ["5d"]);
        assert!(temp.path().join(".git/objects/5d").join(&ID[2..]).is_file());
        Ok(())
    }

    #[test]
    fn missing_object_is_cached_negatively() -> Result<()> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", OBJECT_PATH))
                .times(1)
                .respond_with(status_code(404)),
        );
        let temp = tempdir()?;
        let downloader = downloader(&server, temp.path(), 3)?;
        let id = ObjectId::parse(ID)?;

        for _ in 0..2 {
            let outcome = downloader.fetch_and_store(&id, RequestSource::FileAccess, &never())?;
            assert_eq!(outcome, FetchOutcome::ObjectNotOnServer);
        }
        Ok(())
    }

    #[test]
    fn expired_negative_entry_triggers_new_request() -> Result<()> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", OBJECT_PATH))
                .times(2)
                .respond_with(status_code(404)),
        );
        let temp = tempdir()?;
        let downloader =
            downloader(&server, temp.path(), 3)?.with_negative_cache_ttl(Duration::from_millis(50));
        let id = ObjectId::parse(ID)?;

        downloader.fetch_and_store(&id, RequestSource::FileAccess, &never())?;
        std::thread::sleep(Duration::from_millis(120));
        let outcome = downloader.fetch_and_store(&id, RequestSource::FileAccess, &never())?;
        assert_eq!(outcome, FetchOutcome::ObjectNotOnServer);
        Ok(())
    }

    #[test]
    fn wrong_content_type_is_not_retried() -> Result<()> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", OBJECT_PATH))
                .times(1)
                .respond_with(
                    status_code(200)
                        .insert_header("Content-Type", "text/html")
                        .body("<html>"),
                ),
        );
        let temp = tempdir()?;
        let downloader = downloader(&server, temp.path(), 4)?;
        let id = ObjectId::parse(ID)?;

        let err = downloader
            .fetch_and_store(&id, RequestSource::FileAccess, &never())
            .unwrap_err();
        assert!(matches!(err, DownloadError::Malformed { .. }), "{err}");
        assert!(!downloader.enlistment.loose_object_path(&id).exists());
        Ok(())
    }

    #[test]
    fn server_errors_are_retried_until_exhausted() -> Result<()> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", OBJECT_PATH))
                .times(3)
                .respond_with(status_code(503)),
        );
        let temp = tempdir()?;
        let downloader = downloader(&server, temp.path(), 3)?;
        let id = ObjectId::parse(ID)?;

        let err = downloader
            .fetch_and_store(&id, RequestSource::FileAccess, &never())
            .unwrap_err();
        assert!(matches!(err, DownloadError::Status { status: 503, .. }));
        Ok(())
    }

    #[test]
    fn client_errors_fail_fast() -> Result<()> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", OBJECT_PATH))
                .times(1)
                .respond_with(status_code(401)),
        );
        let temp = tempdir()?;
        let downloader = downloader(&server, temp.path(), 5)?;
        let id = ObjectId::parse(ID)?;

        let err = downloader
            .fetch_and_store(&id, RequestSource::Command, &never())
            .unwrap_err();
        assert!(matches!(err, DownloadError::Status { status: 401, .. }));
        Ok(())
    }

    #[test]
    fn null_id_is_rejected_without_network() -> Result<()> {
        let server = Server::run();
        let temp = tempdir()?;
        let downloader = downloader(&server, temp.path(), 3)?;
        let id = ObjectId::parse(&"0".repeat(40))?;
        let err = downloader
            .fetch_and_store(&id, RequestSource::FileAccess, &never())
            .unwrap_err();
        assert!(matches!(err, DownloadError::NullObjectId));
        Ok(())
    }

    #[test]
    fn existing_copy_is_kept_unless_git_asked() -> Result<()> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", OBJECT_PATH))
                .times(1)
                .respond_with(loose_object_reply()),
        );
        let temp = tempdir()?;
        let downloader = downloader(&server, temp.path(), 3)?;
        let id = ObjectId::parse(ID)?;
        let path = downloader.enlistment.loose_object_path(&id);
        fs::create_dir_all(path.parent().expect("fan-out dir"))?;
        fs::write(&path, "corrupt")?;

        let kept = downloader.fetch_and_store(&id, RequestSource::FileAccess, &never())?;
        assert!(matches!(kept, FetchOutcome::AlreadyPresent { .. }));
        assert_eq!(fs::read_to_string(&path)?, "corrupt");

        let replaced = downloader.fetch_and_store(&id, RequestSource::GitSubprocess, &never())?;
        assert!(matches!(replaced, FetchOutcome::Stored { .. }));
        assert_eq!(fs::read_to_string(&path)?, "compressed-object");
        Ok(())
    }

    #[test]
    fn cancellation_ends_only_its_own_fetch() -> Result<()> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", OTHER_PATH))
                .times(1)
                .respond_with(loose_object_reply()),
        );
        let temp = tempdir()?;
        let downloader = downloader(&server, temp.path(), 3)?;
        let cancelled = CancellationToken::new();
        cancelled.cancel();

        let err = downloader
            .fetch_and_store(&ObjectId::parse(ID)?, RequestSource::FileAccess, &cancelled)
            .unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled { .. }));

        let later = downloader.fetch_and_store(
            &ObjectId::parse(OTHER_ID)?,
            RequestSource::FileAccess,
            &never(),
        )?;
        assert!(matches!(later, FetchOutcome::Stored { bytes: 17, .. }), "{later:?}");
        Ok(())
    }

    #[test]
    fn batch_reports_each_object() -> Result<()> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", OBJECT_PATH))
                .respond_with(loose_object_reply()),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", OTHER_PATH))
                .respond_with(status_code(404)),
        );
        let temp = tempdir()?;
        let downloader = downloader(&server, temp.path(), 3)?;
        let ids = [ObjectId::parse(ID)?, ObjectId::parse(OTHER_ID)?];

        let results = downloader.fetch_and_store_batch(&ids, RequestSource::Command, &never());
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0].1, Ok(FetchOutcome::Stored { bytes: 17, .. })));
        assert!(matches!(results[1].1, Ok(FetchOutcome::ObjectNotOnServer)));
        Ok(())
    }

    #[test]
    fn requires_an_object_server() -> Result<()> {
        let temp = tempdir()?;
        let enlistment = Enlistment::from_path(temp.path())?;
        assert!(ObjectDownloader::new(enlistment, &network(3)).is_err());
        Ok(())
    }
}
