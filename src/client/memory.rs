use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::RwLock;
use tracing::{event, Level};

use super::{RangeClient, UploadClient, UploadSource};

/// Struct that implements the range and upload clients over a single in-memory object,
///
/// Clones share the same object, which makes it handy for pairing a writer w/ a reader,
///
#[derive(Clone, Default)]
pub struct MemoryClient {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Current object body, None if nothing has been uploaded,
    ///
    object: RwLock<Option<Bytes>>,
    /// Max bytes returned by a single read on a range stream, 0 is unlimited,
    ///
    frame_size: AtomicUsize,
    /// Number of ranges opened so far,
    ///
    range_opens: AtomicUsize,
    /// Number of upcoming range opens that should fail,
    ///
    failing_opens: AtomicUsize,
    /// If set, uploads are rejected w/o reading the source,
    ///
    fail_uploads: AtomicBool,
}

impl MemoryClient {
    /// Returns a client over an existing object,
    ///
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            inner: Arc::new(Inner {
                object: RwLock::new(Some(content.into())),
                ..Default::default()
            }),
        }
    }

    /// Limits how many bytes a single read on a range stream returns,
    ///
    /// Used to mimic a network body that arrives in frames,
    ///
    pub fn with_frame_size(self, frame_size: usize) -> Self {
        self.inner.frame_size.store(frame_size, Ordering::SeqCst);
        self
    }

    /// Makes the next `count` range opens fail,
    ///
    pub fn fail_next_opens(&self, count: usize) {
        self.inner.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Makes uploads fail,
    ///
    pub fn fail_uploads(&self, fail: bool) {
        self.inner.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of range opens so far,
    ///
    pub fn range_opens(&self) -> usize {
        self.inner.range_opens.load(Ordering::SeqCst)
    }

    /// Returns the current object body,
    ///
    pub async fn contents(&self) -> Option<Bytes> {
        self.inner.object.read().await.clone()
    }
}

#[async_trait]
impl RangeClient for MemoryClient {
    type Stream = MemoryRange;

    fn describe(&self) -> String {
        String::from("memory object")
    }

    async fn probe_size(&self) -> io::Result<Option<u64>> {
        match self.inner.object.read().await.as_ref() {
            Some(object) => Ok(Some(object.len() as u64)),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such object")),
        }
    }

    async fn open_range(&self, offset: u64, count: u64) -> io::Result<Self::Stream> {
        self.inner.range_opens.fetch_add(1, Ordering::SeqCst);

        if self
            .inner
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "range open rejected",
            ));
        }

        let object = self
            .inner
            .object
            .read()
            .await
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such object"))?;

        let end = offset.saturating_add(count);
        if end > object.len() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("range {offset}..{end} exceeds object size {}", object.len()),
            ));
        }

        event!(Level::TRACE, "Opening memory range {offset}..{end}");
        Ok(MemoryRange {
            data: object.slice(offset as usize..end as usize),
            frame_size: self.inner.frame_size.load(Ordering::SeqCst),
        })
    }
}

#[async_trait]
impl UploadClient for MemoryClient {
    async fn upload(&self, mut source: UploadSource) -> io::Result<u64> {
        if self.inner.fail_uploads.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "upload rejected"));
        }

        let mut body = vec![];
        source.read_to_end(&mut body).await?;

        let len = body.len() as u64;
        *self.inner.object.write().await = Some(Bytes::from(body));
        Ok(len)
    }
}

/// Forward-only stream over a slice of a memory object,
///
pub struct MemoryRange {
    data: Bytes,
    frame_size: usize,
}

impl AsyncRead for MemoryRange {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut n = buf.remaining().min(self.data.len());
        if self.frame_size > 0 {
            n = n.min(self.frame_size);
        }

        let frame = self.data.split_to(n);
        buf.put_slice(&frame);
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn test_memory_client() {
    let client = MemoryClient::new(&b"Hello World"[..]).with_frame_size(4);
    assert_eq!(client.probe_size().await.ok(), Some(Some(11)));

    let mut stream = client.open_range(6, 5).await.expect("should open");
    let mut buf = [0; 16];
    assert_eq!(stream.read(&mut buf).await.ok(), Some(4));
    assert_eq!(&buf[..4], b"Worl");

    let mut rest = String::new();
    stream.read_to_string(&mut rest).await.expect("should read");
    assert_eq!(rest, "d");

    assert!(client.open_range(6, 6).await.is_err());
    client.fail_next_opens(1);
    assert!(client.open_range(0, 1).await.is_err());
    assert!(client.open_range(0, 1).await.is_ok());
    assert_eq!(client.range_opens(), 4);
}
