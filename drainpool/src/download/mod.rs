// SPDX-License-Identifier: MIT

//! Download manager built on a [`ConsumerPool`].
//!
//! Every download is tracked by its source URL. Asynchronous downloads are
//! queued for the pool, blocking ones run inline in the caller. Either way the
//! URL walks through `Requested -> InProgress -> Done | Failed` in the pool's
//! [`TaskStateTracker`].

pub mod fetch;

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};

pub use fetch::{copy_chunked, fetch_bytes, Fetch, FileFetcher, BUF_SIZE};

use crate::error::{PoolError, Result};
use crate::global_config::PoolConfig;
use crate::pool::{ConsumerPool, RecordHandler, ShutdownReport, WorkerContext};
use crate::shared_state;
use crate::task_state::{Admission, TaskState, TaskStateTracker};

/// Where the downloaded bytes go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Kept in the tracker until the result is fetched.
    Memory,
    File(PathBuf),
}

/// Value of a `Done` download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Downloaded {
    Memory(Vec<u8>),
    File(PathBuf),
    /// The target file existed and overwriting was not requested.
    Existing(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Queue the download and return right away.
    #[default]
    Async,
    /// Download in the calling thread.
    Blocking,
}

/// Returned by every download call. Identifies the download by URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DownloadHandle {
    url: String,
}

impl DownloadHandle {
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Record carried through the pool's queue.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub target: Target,
    pub overwrite: bool,
}

type Tracker = TaskStateTracker<String, Downloaded>;

struct DownloadHandler {
    fetcher: Box<dyn Fetch>,
    tracker: Arc<Tracker>,
}

impl DownloadHandler {
    /// Runs one admitted request to a terminal state.
    fn run(&self, request: DownloadRequest) -> Result<()> {
        self.tracker.start(&request.url)?;
        let outcome = self.perform(&request).map_err(|err| format!("{err:#}"));
        match &outcome {
            Ok(_) => info!("Downloaded {}", request.url),
            Err(err) => warn!("Download of {} failed: {err}", request.url),
        }
        self.tracker.finish(&request.url, outcome)
    }

    fn perform(&self, request: &DownloadRequest) -> anyhow::Result<Downloaded> {
        let path = match &request.target {
            Target::Memory => {
                return Ok(Downloaded::Memory(fetch_bytes(
                    self.fetcher.as_ref(),
                    &request.url,
                )?))
            }
            Target::File(path) => path,
        };

        if path.exists() && !request.overwrite {
            debug!("{} exists, not downloading {}", path.display(), request.url);
            return Ok(Downloaded::Existing(path.clone()));
        }

        // Fetch first so that a failed download leaves an existing file alone.
        let bytes = fetch_bytes(self.fetcher.as_ref(), &request.url)?;
        let mut file =
            File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
        file.write_all(&bytes)
            .and_then(|_| file.flush())
            .with_context(|| format!("cannot write {}", path.display()))?;
        Ok(Downloaded::File(path.clone()))
    }
}

impl RecordHandler<DownloadRequest> for DownloadHandler {
    fn desc(&self) -> &str {
        "download"
    }

    fn handle(&self, ctx: &WorkerContext, request: DownloadRequest) -> anyhow::Result<()> {
        debug!("{ctx}: downloading {}", request.url);
        self.run(request)?;
        Ok(())
    }

    /// Fails a request no worker got to, so that its waiters wake up.
    fn discarded(&self, request: DownloadRequest) {
        let failed = self.tracker.start(&request.url).and_then(|()| {
            self.tracker
                .finish(&request.url, Err("discarded on forced shutdown".to_string()))
        });
        match failed {
            Ok(()) => warn!("Download of {} discarded on forced shutdown", request.url),
            Err(err) => warn!("Cannot fail discarded download {}: {err}", request.url),
        }
    }
}

/// A pool of download workers sharing one state tracker.
pub struct DownloadPool {
    pool: ConsumerPool<DownloadRequest>,
    handler: Arc<DownloadHandler>,
    tracker: Arc<Tracker>,
}

impl DownloadPool {
    pub fn new<F: Fetch>(config: PoolConfig, fetcher: F) -> Result<Self> {
        let tracker = Arc::new(Tracker::new());
        let handler = Arc::new(DownloadHandler {
            fetcher: Box::new(fetcher),
            tracker: tracker.clone(),
        });
        let pool = ConsumerPool::<DownloadRequest>::with_shared_handler(config, handler.clone())?;
        Ok(Self {
            pool,
            handler,
            tracker,
        })
    }

    /// The process-wide download pool. Only the first successful call
    /// creates it; later calls ignore their arguments.
    pub fn shared<F: Fetch>(config: PoolConfig, fetcher: F) -> Result<Arc<Self>> {
        shared_state::acquire(|| Ok(Self::new(config, fetcher)?))
    }

    /// Downloads `url` into `target`.
    ///
    /// A URL that is already requested or in progress is left alone and so is
    /// a finished one unless `overwrite` is set. Either case still returns a
    /// handle to the existing download. Failed URLs are always retried.
    pub fn download(
        &self,
        url: &str,
        target: Target,
        mode: Mode,
        overwrite: bool,
    ) -> Result<DownloadHandle> {
        let handle = DownloadHandle {
            url: url.to_string(),
        };

        match self.tracker.request(url.to_string(), overwrite) {
            Admission::Admitted => {}
            admission => {
                debug!("Not downloading {url} again: {admission:?}");
                return Ok(handle);
            }
        }

        let request = DownloadRequest {
            url: url.to_string(),
            target,
            overwrite,
        };
        match mode {
            Mode::Blocking => self.handler.run(request)?,
            Mode::Async => {
                if let Err(request) = self.pool.try_submit(request) {
                    self.tracker.withdraw(&request.url);
                    return Err(PoolError::PoolClosed(self.pool.name().to_string()));
                }
            }
        }
        Ok(handle)
    }

    pub fn download_async(&self, url: &str, target: Target, overwrite: bool) -> Result<DownloadHandle> {
        self.download(url, target, Mode::Async, overwrite)
    }

    pub fn download_blocking(
        &self,
        url: &str,
        target: Target,
        overwrite: bool,
    ) -> Result<DownloadHandle> {
        self.download(url, target, Mode::Blocking, overwrite)
    }

    /// `None` means the URL is unknown.
    pub fn get_state(&self, url: &str) -> Option<TaskState<Downloaded>> {
        self.tracker.get_state(&url.to_string())
    }

    /// Blocks until the download is done or failed.
    pub fn wait(
        &self,
        handle: &DownloadHandle,
        timeout: Option<Duration>,
    ) -> Option<TaskState<Downloaded>> {
        self.tracker.wait_until_terminal(&handle.url, timeout)
    }

    pub fn fetch_result(
        &self,
        handle: &DownloadHandle,
        block: bool,
        discard_done: bool,
    ) -> Option<Downloaded> {
        self.tracker.fetch_result(&handle.url, block, discard_done)
    }

    /// Forgets a finished download so that its URL can be downloaded again.
    pub fn discard_result(&self, handle: &DownloadHandle) -> Option<TaskState<Downloaded>> {
        self.tracker.discard(&handle.url)
    }

    pub fn tracker(&self) -> &TaskStateTracker<String, Downloaded> {
        &self.tracker
    }

    pub fn pool(&self) -> &ConsumerPool<DownloadRequest> {
        &self.pool
    }

    /// Downloads still queued when the timeout hits end up `Failed`.
    pub fn shutdown(&self, timeout: Option<Duration>) -> Result<ShutdownReport> {
        self.pool.shutdown(timeout)
    }
}

impl std::fmt::Debug for DownloadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadPool")
            .field("pool", &self.pool)
            .field("tracker", &self.tracker)
            .finish()
    }
}
