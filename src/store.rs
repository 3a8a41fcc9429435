// ObjectStore: one persisted value per handle, written in the background

use eyre::{Context, Result};
use futures::channel::oneshot;
use serde::{Serialize, de::DeserializeOwned};
use std::fmt;
use std::fs;
use std::future::Future;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::atomic;
use crate::codec::{Codec, JsonCodec};
use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::handle::StoreHandle;
use crate::notify::Notifier;
use crate::queue::{Task, TaskKind, TaskQueue};

/// Persists one value of type `T` to `<dir>/<name>.obj`.
///
/// `write`, `read*` and `clear` never block: they queue work on the
/// [`TaskQueue`] worker. Writes are debounced by the write interval, so a
/// burst of writes costs one disk write holding the last value. `drain`
/// blocks until everything queued for this store has run.
///
/// Read failures of any kind (missing file, I/O error, decode error) come
/// back as `None`; use [`ObjectStore::read_result`] to tell them apart.
pub struct ObjectStore<T, C = JsonCodec<T>> {
    handle: StoreHandle,
    queue: TaskQueue,
    codec: Arc<C>,
    notifier: Option<Arc<dyn Notifier>>,
    write_interval: Duration,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ObjectStore<T, JsonCodec<T>>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Open a JSON-backed store in the configured default directory
    pub fn open(name: &str) -> Result<Self> {
        Self::builder(name).open()
    }

    /// Open a JSON-backed store in `dir`
    pub fn open_in(name: &str, dir: impl AsRef<Path>) -> Result<Self> {
        Self::builder(name).dir(dir).open()
    }

    pub fn builder(name: &str) -> StoreBuilder<T, JsonCodec<T>> {
        StoreBuilder {
            name: name.to_string(),
            dir: None,
            config: None,
            write_interval: None,
            queue: None,
            codec: JsonCodec::new(),
            notifier: None,
            _marker: PhantomData,
        }
    }
}

impl<T, C> ObjectStore<T, C>
where
    T: Send + 'static,
    C: Codec<T>,
{
    pub fn handle(&self) -> &StoreHandle {
        &self.handle
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn write_interval(&self) -> Duration {
        self.write_interval
    }

    /// Schedule `value` to be persisted after the write interval.
    ///
    /// A write still waiting for its interval is replaced, and the interval
    /// restarts. `None` clears the slot (both files are deleted) on the same
    /// debounced schedule.
    pub fn write(&self, value: Option<T>) {
        let handle = self.handle.clone();
        let codec = Arc::clone(&self.codec);

        self.queue.submit(
            &self.handle,
            Task::new(TaskKind::Write, move || write_sync(&handle, codec.as_ref(), value.as_ref())),
            self.write_interval,
        );
        debug!(store = %self.handle, "write: scheduled");
    }

    /// Read the stored value and hand it to `callback`.
    ///
    /// With `deliver_on_preferred` the callback is posted to the store's
    /// notifier; otherwise (or when no notifier is configured) it runs on the
    /// worker thread, where it must not call `drain` or `read_blocking`.
    pub fn read_with<F>(&self, deliver_on_preferred: bool, callback: F)
    where
        F: FnOnce(Option<T>) + Send + 'static,
    {
        let handle = self.handle.clone();
        let codec = Arc::clone(&self.codec);
        let notifier = if deliver_on_preferred {
            if self.notifier.is_none() {
                debug!(store = %self.handle, "read_with: no notifier configured, delivering on worker");
            }
            self.notifier.clone()
        } else {
            None
        };

        self.queue.submit(
            &self.handle,
            Task::new(TaskKind::Read, move || {
                let value: Option<T> = read0(&handle, codec.as_ref());
                match notifier {
                    Some(notifier) => notifier.post(Box::new(move || callback(value))),
                    None => callback(value),
                }
                Ok(())
            }),
            Duration::ZERO,
        );
    }

    /// Read the stored value as a future that resolves exactly once.
    ///
    /// The value is delivered to whoever awaits the future, on that task's
    /// executor. Dropping the future before the read runs discards the result.
    pub fn read(&self) -> ReadFuture<Option<T>> {
        let (tx, rx) = oneshot::channel();
        let handle = self.handle.clone();
        let codec = Arc::clone(&self.codec);

        self.queue.submit(
            &self.handle,
            Task::new(TaskKind::Read, move || {
                if tx.send(read0(&handle, codec.as_ref())).is_err() {
                    debug!(store = %handle, "read: receiver dropped, discarding value");
                }
                Ok(())
            }),
            Duration::ZERO,
        );

        ReadFuture::new(rx, || None)
    }

    /// Like [`read`](Self::read) but keeps the failure reason.
    ///
    /// `Ok(None)` means nothing is stored; I/O and decode failures are errors.
    pub fn read_result(&self) -> ReadFuture<StoreResult<Option<T>>> {
        let (tx, rx) = oneshot::channel();
        let handle = self.handle.clone();
        let codec = Arc::clone(&self.codec);

        self.queue.submit(
            &self.handle,
            Task::new(TaskKind::Read, move || {
                if tx.send(read_detailed(&handle, codec.as_ref())).is_err() {
                    debug!(store = %handle, "read_result: receiver dropped, discarding value");
                }
                Ok(())
            }),
            Duration::ZERO,
        );

        ReadFuture::new(rx, || Err(StoreError::Cancelled))
    }

    /// Block the calling thread until the read completes.
    ///
    /// # Panics
    ///
    /// Panics when called from the worker thread.
    pub fn read_blocking(&self) -> Option<T> {
        self.queue.ensure_not_worker("read_blocking");
        futures::executor::block_on(self.read())
    }

    /// Drop any pending write or delete, then delete both files
    pub fn clear(&self) {
        let writes = self.queue.cancel_pending(&self.handle, TaskKind::Write);
        let deletes = self.queue.cancel_pending(&self.handle, TaskKind::Delete);
        let handle = self.handle.clone();

        self.queue.submit(
            &self.handle,
            Task::new(TaskKind::Delete, move || delete_files(&handle)),
            Duration::ZERO,
        );
        debug!(store = %self.handle, cancelled = writes + deletes, "clear: scheduled delete");
    }

    /// Block until every task queued for this store has finished.
    ///
    /// # Panics
    ///
    /// Panics when called from the worker thread.
    pub fn drain(&self) {
        self.queue.drain(&self.handle);
    }

    /// Run a pending debounced write now instead of after the interval, then drain
    pub fn flush(&self) {
        self.queue.expedite(&self.handle);
        self.queue.drain(&self.handle);
    }

    /// Number of queued or running tasks for this store
    pub fn pending(&self) -> usize {
        self.queue.pending_count(&self.handle)
    }

    /// Whether a committed value is on disk right now (ignores queued work)
    pub fn exists(&self) -> bool {
        self.handle.primary_path().is_file()
    }
}

impl<T, C> Clone for ObjectStore<T, C> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            queue: self.queue.clone(),
            codec: Arc::clone(&self.codec),
            notifier: self.notifier.clone(),
            write_interval: self.write_interval,
            _marker: PhantomData,
        }
    }
}

impl<T, C> fmt::Debug for ObjectStore<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStore")
            .field("handle", &self.handle)
            .field("write_interval", &self.write_interval)
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

/// Options for opening an [`ObjectStore`]
pub struct StoreBuilder<T, C> {
    name: String,
    dir: Option<PathBuf>,
    config: Option<Config>,
    write_interval: Option<Duration>,
    queue: Option<TaskQueue>,
    codec: C,
    notifier: Option<Arc<dyn Notifier>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C> StoreBuilder<T, C>
where
    T: Send + 'static,
    C: Codec<T>,
{
    /// Directory for the store files (overrides the config's `store_dir`)
    pub fn dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Debounce interval (overrides the config's `write_interval_ms`)
    pub fn write_interval(mut self, interval: Duration) -> Self {
        self.write_interval = Some(interval);
        self
    }

    /// Run tasks on `queue` instead of the process-wide one
    pub fn queue(mut self, queue: TaskQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn codec<C2: Codec<T>>(self, codec: C2) -> StoreBuilder<T, C2> {
        StoreBuilder {
            name: self.name,
            dir: self.dir,
            config: self.config,
            write_interval: self.write_interval,
            queue: self.queue,
            codec,
            notifier: self.notifier,
            _marker: PhantomData,
        }
    }

    pub fn open(self) -> Result<ObjectStore<T, C>> {
        let config = self.config.unwrap_or_default();
        let dir = self.dir.unwrap_or_else(|| config.store_dir.clone());
        let handle = StoreHandle::new(&self.name, &dir)?;

        fs::create_dir_all(&dir).context(format!("Failed to create store directory {}", dir.display()))?;

        if handle.temp_path().exists() {
            warn!(
                store = %handle,
                temp = %handle.temp_path().display(),
                "Found leftover temp file from an interrupted write, leaving it untouched"
            );
        }
        info!(
            store = %handle,
            file = %handle.primary_path().display(),
            previous_exists = handle.primary_path().exists(),
            "Opened object store"
        );

        let queue = self
            .queue
            .unwrap_or_else(|| TaskQueue::shared_with(config.queue_config()));

        Ok(ObjectStore {
            handle,
            queue,
            codec: Arc::new(self.codec),
            notifier: self.notifier,
            write_interval: self.write_interval.unwrap_or_else(|| config.write_interval()),
            _marker: PhantomData,
        })
    }
}

/// Resolves once with the outcome of a queued read
#[must_use = "futures do nothing unless polled"]
pub struct ReadFuture<R> {
    rx: oneshot::Receiver<R>,
    on_cancel: fn() -> R,
}

impl<R> ReadFuture<R> {
    fn new(rx: oneshot::Receiver<R>, on_cancel: fn() -> R) -> Self {
        Self { rx, on_cancel }
    }
}

impl<R> Future for ReadFuture<R> {
    type Output = R;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<R> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(value),
            // The task was cancelled or the queue dropped it unexecuted
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready((this.on_cancel)()),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<R> fmt::Debug for ReadFuture<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadFuture").finish_non_exhaustive()
    }
}

// ============================================================================
// Worker-side task bodies
// ============================================================================

fn write_sync<T, C: Codec<T>>(handle: &StoreHandle, codec: &C, value: Option<&T>) -> Result<()> {
    let Some(value) = value else {
        delete_files(handle)?;
        info!(store = %handle, "write_sync: value is None, deleted store files");
        return Ok(());
    };

    let bytes = codec
        .encode(value)
        .wrap_err(format!("Failed to encode value for {}", handle))?;
    atomic::write_atomic(handle.primary_path(), handle.temp_path(), &bytes)?;

    debug!(store = %handle, bytes = bytes.len(), "write_sync: success");
    Ok(())
}

fn delete_files(handle: &StoreHandle) -> Result<()> {
    atomic::delete(handle.temp_path())?;
    atomic::delete(handle.primary_path())?;
    debug!(store = %handle, "delete_files: done");
    Ok(())
}

fn read0<T, C: Codec<T>>(handle: &StoreHandle, codec: &C) -> Option<T> {
    let bytes = atomic::read_bytes(handle.primary_path())?;
    match codec.decode(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(store = %handle, error = ?e, "read0: failed to decode, treating as absent");
            None
        }
    }
}

fn read_detailed<T, C: Codec<T>>(handle: &StoreHandle, codec: &C) -> StoreResult<Option<T>> {
    let path = handle.primary_path();
    let bytes = atomic::try_read_bytes(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    match bytes {
        Some(bytes) => Ok(Some(codec.decode(&bytes)?)),
        None => Ok(None),
    }
}
