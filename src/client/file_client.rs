use std::{io::{self, SeekFrom}, path::{Path, PathBuf}, sync::Arc};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, DuplexStream};
use tracing::{event, Level};

use crate::options::DEFAULT_PIPE_CAPACITY;

use super::{RangeClient, UploadClient, UploadSource};

/// Struct that implements the range and upload clients w/ a file,
///
/// Ranges are streamed through a duplex by a background task, so readers see the same
/// forward-only, framed body they would get from a remote store,
///
#[derive(Clone)]
pub struct FileClient {
    path: Arc<PathBuf>,
    capacity: usize,
}

impl FileClient {
    /// Returns a new file client for `path`,
    ///
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            capacity: DEFAULT_PIPE_CAPACITY,
        }
    }

    /// Sets the duplex capacity used for range streams,
    ///
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Returns the path of the backing file,
    ///
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

#[async_trait]
impl RangeClient for FileClient {
    type Stream = DuplexStream;

    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn probe_size(&self) -> io::Result<Option<u64>> {
        let metadata = tokio::fs::metadata(self.path.as_ref()).await?;
        Ok(Some(metadata.len()))
    }

    async fn open_range(&self, offset: u64, count: u64) -> io::Result<Self::Stream> {
        let mut file = tokio::fs::File::open(self.path.as_ref()).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let (mut tx, rx) = tokio::io::duplex(self.capacity);

        let path = self.path.clone();
        tokio::spawn(async move {
            let mut range = file.take(count);
            match tokio::io::copy(&mut range, &mut tx).await {
                Ok(copied) if copied == count => {
                    event!(Level::TRACE, "Streamed {copied} bytes from {:?}", path);
                }
                Ok(copied) => {
                    event!(
                        Level::WARN,
                        "Range of {:?} ended early, {copied} of {count} bytes",
                        path
                    );
                }
                Err(err) => {
                    // The reader dropped the stream, ex. after a seek
                    event!(Level::DEBUG, "Range stream for {:?} closed, {err}", path);
                }
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl UploadClient for FileClient {
    async fn upload(&self, mut source: UploadSource) -> io::Result<u64> {
        let mut file = tokio::fs::File::create(self.path.as_ref()).await?;
        let uploaded = tokio::io::copy(&mut source, &mut file).await?;
        file.flush().await?;

        event!(Level::DEBUG, "Wrote {uploaded} bytes to {:?}", self.path);
        Ok(uploaded)
    }
}

#[tokio::test]
async fn test_file_client() {
    let client = FileClient::new(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml"))
        .with_capacity(8);

    let mut bytes = vec![];
    assert_eq!(
        client
            .open_range(0, 50)
            .await
            .expect("should open")
            .read_to_end(&mut bytes)
            .await
            .expect("can read"),
        (0..50).len()
    );
    assert!(bytes.starts_with(b"[package]"));
}

#[tokio::test]
async fn test_file_client_upload() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let client = FileClient::new(dir.path().join("uploaded"));

    let uploaded = client
        .upload(Box::new(&b"hello world"[..]))
        .await
        .expect("should upload");
    assert_eq!(uploaded, 11);
    assert_eq!(client.probe_size().await.ok(), Some(Some(11)));

    let mut tail = String::new();
    client
        .open_range(6, 5)
        .await
        .expect("should open")
        .read_to_string(&mut tail)
        .await
        .expect("can read");
    assert_eq!(tail, "world");
}
