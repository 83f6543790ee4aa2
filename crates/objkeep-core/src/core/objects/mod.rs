//! Object download path used by foreground file access.

pub mod downloader;
pub mod negative_cache;
pub mod retry;

pub use downloader::{DownloadError, FetchOutcome, ObjectDownloader, RequestSource};
pub use negative_cache::{NegativeCache, NEGATIVE_CACHE_TTL};
pub use retry::{CallbackResult, CancellationToken, FailureEvent, InvocationResult, RetryExecutor};
