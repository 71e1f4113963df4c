//! Background disk I/O worker.
//!
//! Requests travel over a bounded queue to a single blocking task that owns
//! the [`Disk`]; each request carries a one-shot channel for its reply.

use super::Disk;
use crate::candle::CandleSet;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{Page, PageHeader};
use log::debug;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

type Reply<T> = oneshot::Sender<StorageResult<T>>;

enum DiskRequest {
    Read {
        set: CandleSet,
        reply: Reply<Option<Page>>,
    },
    ReadHeader {
        set: CandleSet,
        reply: Reply<Option<PageHeader>>,
    },
    Write {
        page: Page,
        reply: Reply<()>,
    },
    WriteIfNewer {
        page: Page,
        reply: Reply<bool>,
    },
    Shutdown,
}

/// Client handle to the disk worker.
pub struct DiskWorker {
    sender: mpsc::Sender<DiskRequest>,
    disk: Arc<Disk>,
}

impl DiskWorker {
    /// Starts the worker on `handle`'s blocking pool.
    pub fn spawn(disk: Arc<Disk>, handle: &Handle, queue_depth: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel(queue_depth.max(1));
        let worker_disk = Arc::clone(&disk);
        handle.spawn_blocking(move || {
            while let Some(request) = receiver.blocking_recv() {
                if !serve(&worker_disk, request) {
                    break;
                }
            }
            debug!("disk worker stopped");
        });
        Self { sender, disk }
    }

    pub fn disk(&self) -> &Disk {
        &self.disk
    }

    /// Sends one request and blocks until the worker replies.
    ///
    /// # Panics
    ///
    /// Panics when called from inside an async context: both
    /// `blocking_send` and `blocking_recv` refuse to run on a runtime
    /// thread. Async callers go through `spawn_blocking`.
    fn call<T>(&self, request: impl FnOnce(Reply<T>) -> DiskRequest) -> StorageResult<T> {
        let (reply, response) = oneshot::channel();
        self.sender
            .blocking_send(request(reply))
            .map_err(|_| StorageError::WorkerStopped)?;
        response
            .blocking_recv()
            .map_err(|_| StorageError::WorkerStopped)?
    }

    pub fn read(&self, set: &CandleSet) -> StorageResult<Option<Page>> {
        self.call(|reply| DiskRequest::Read {
            set: set.clone(),
            reply,
        })
    }

    pub fn read_header(&self, set: &CandleSet) -> StorageResult<Option<PageHeader>> {
        self.call(|reply| DiskRequest::ReadHeader {
            set: set.clone(),
            reply,
        })
    }

    pub fn write(&self, page: Page) -> StorageResult<()> {
        self.call(|reply| DiskRequest::Write { page, reply })
    }

    pub fn write_if_newer(&self, page: Page) -> StorageResult<bool> {
        self.call(|reply| DiskRequest::WriteIfNewer { page, reply })
    }

    /// Stops the worker once queued requests are served. Later calls fail
    /// with [`StorageError::WorkerStopped`].
    pub fn shutdown(&self) {
        let _ = self.sender.blocking_send(DiskRequest::Shutdown);
    }
}

/// Serves one request. Returns `false` on shutdown.
fn serve(disk: &Disk, request: DiskRequest) -> bool {
    // A dropped receiver only means the caller gave up waiting.
    match request {
        DiskRequest::Read { set, reply } => {
            let _ = reply.send(disk.read(&set));
        }
        DiskRequest::ReadHeader { set, reply } => {
            let _ = reply.send(disk.read_header(&set));
        }
        DiskRequest::Write { page, reply } => {
            let _ = reply.send(disk.write(&page));
        }
        DiskRequest::WriteIfNewer { page, reply } => {
            let _ = reply.send(disk.write_if_newer(&page));
        }
        DiskRequest::Shutdown => return false,
    }
    true
}
