use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::{Error, Options, Result, SequentialWrite, UploadClient};

/// Slot the upload task records its failure in,
///
type UploadError = Arc<std::sync::Mutex<Option<Error>>>;

/// Struct that streams sequential writes into a single upload,
///
/// Writes go into one end of a bounded duplex, a background task hands the other end to the
/// upload client as the object body. When the pipe is full, writes wait for the upload to catch up,
///
/// Dropping the writer w/o calling close cancels the upload, nothing is committed,
///
pub struct BlobWriter {
    inner: Mutex<Inner>,
    upload_error: UploadError,
    /// Set by close, before that the end of the pipe is an error for the upload,
    ///
    sealed: Arc<AtomicBool>,
}

/// Read end of the pipe handed to the upload client,
///
/// Reaching the end of the pipe is only a clean end of the body once the writer was closed,
///
struct SealedPipe {
    pipe: DuplexStream,
    sealed: Arc<AtomicBool>,
}

impl AsyncRead for SealedPipe {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let filled = buf.filled().len();
        ready!(Pin::new(&mut this.pipe).poll_read(cx, buf))?;

        if buf.filled().len() == filled && buf.remaining() > 0 && !this.sealed.load(Ordering::Acquire) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "writer dropped before close",
            )));
        }
        Poll::Ready(Ok(()))
    }
}

struct Inner {
    /// Write end of the pipe, None once closed,
    ///
    pipe: Option<DuplexStream>,
    /// Upload task, None once joined,
    ///
    upload: Option<JoinHandle<()>>,
    /// Bytes accepted so far,
    ///
    written: u64,
    /// True once close has been called,
    ///
    closed: bool,
}

impl BlobWriter {
    /// Starts an upload through `client`,
    ///
    /// Must be called within a tokio runtime,
    ///
    pub fn start<U>(client: U, options: &Options) -> Self
    where
        U: UploadClient,
    {
        let (tx, rx) = tokio::io::duplex(options.pipe_capacity.max(1));
        let upload_error = UploadError::default();
        let sealed = Arc::new(AtomicBool::new(false));

        let recorded = upload_error.clone();
        let source = SealedPipe {
            pipe: rx,
            sealed: sealed.clone(),
        };
        let upload = tokio::spawn(async move {
            match client.upload(Box::new(source)).await {
                Ok(uploaded) => {
                    event!(Level::DEBUG, "Upload finished, {uploaded} bytes");
                }
                Err(err) => {
                    event!(Level::ERROR, "Upload failed, {err}");
                    if let Ok(mut slot) = recorded.lock() {
                        slot.get_or_insert(Error::backend("upload", err));
                    }
                }
            }
        });

        Self {
            inner: Mutex::new(Inner {
                pipe: Some(tx),
                upload: Some(upload),
                written: 0,
                closed: false,
            }),
            upload_error,
            sealed,
        }
    }

    /// Returns the number of bytes accepted so far,
    ///
    pub async fn written(&self) -> u64 {
        self.inner.lock().await.written
    }

    /// Returns the upload task's error if it has recorded one,
    ///
    fn recorded_error(&self) -> Option<Error> {
        self.upload_error.lock().ok().and_then(|slot| slot.clone())
    }

    /// Waits for the upload task,
    ///
    async fn join(&self, inner: &mut Inner) -> Result<()> {
        if let Some(upload) = inner.upload.take() {
            if let Err(err) = upload.await {
                return Err(Error::InternalInconsistency(format!(
                    "upload task did not complete, {err}"
                )));
            }
        }

        match self.recorded_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SequentialWrite for BlobWriter {
    async fn write(&self, buf: &[u8]) -> Result<usize> {
        if let Some(err) = self.recorded_error() {
            return Err(err);
        }

        let mut inner = self.inner.lock().await;
        let pipe = inner.pipe.as_mut().ok_or_else(Error::closed)?;

        match pipe.write_all(buf).await {
            Ok(()) => {
                inner.written += buf.len() as u64;
                Ok(buf.len())
            }
            Err(err) => {
                // The upload dropped its end of the pipe, its own error explains why
                event!(Level::DEBUG, "Upload pipe closed during write, {err}");
                inner.pipe.take();
                self.join(&mut inner).await?;
                Err(Error::from(err))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;

        let closing = match inner.pipe.take() {
            Some(mut pipe) => {
                self.sealed.store(true, Ordering::Release);
                pipe.shutdown().await
            }
            None => Ok(()),
        };

        let joining = inner.upload.is_some();
        self.join(&mut inner).await?;
        closing?;

        if joining {
            event!(Level::DEBUG, "Closed writer after {} bytes", inner.written);
        }
        Ok(())
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if let Some(upload) = self.inner.get_mut().upload.take() {
            event!(Level::WARN, "Writer dropped before close, cancelling upload");
            upload.abort();
        }
    }
}
