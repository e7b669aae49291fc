use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{event, Level};

use crate::handle::resolve_target;
use crate::{Error, RandomAccess, ReadOutcome, Result, SequentialWrite, Whence};

/// Struct that gives a local file the same handle contract as a remote object,
///
pub struct LocalFile {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl LocalFile {
    /// Opens an existing file for reading,
    ///
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        event!(Level::TRACE, "Opened {:?} for reading", path);

        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    /// Creates (or truncates) a file for writing,
    ///
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        event!(Level::TRACE, "Opened {:?} for writing", path);

        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    /// Returns the path of the file,
    ///
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

/// Does a single read into `buf`,
///
async fn read_once(file: &mut File, buf: &mut [u8]) -> Result<ReadOutcome> {
    if buf.is_empty() {
        return Ok(ReadOutcome::Bytes(0));
    }

    match file.read(buf).await? {
        0 => Ok(ReadOutcome::EndOfStream),
        n => Ok(ReadOutcome::Bytes(n)),
    }
}

#[async_trait]
impl RandomAccess for LocalFile {
    async fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        let mut file = self.file.lock().await;
        let file = file.as_mut().ok_or_else(Error::closed)?;
        read_once(file, buf).await
    }

    async fn seek(&self, offset: i64, whence: Whence) -> Result<u64> {
        let mut file = self.file.lock().await;
        let file = file.as_mut().ok_or_else(Error::closed)?;

        let base = match whence {
            Whence::Start => 0,
            Whence::Current => file.stream_position().await?,
            Whence::End => file.metadata().await?.len(),
        };
        let target = resolve_target(base, offset)?;

        Ok(file.seek(SeekFrom::Start(target)).await?)
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<ReadOutcome> {
        let mut file = self.file.lock().await;
        let file = file.as_mut().ok_or_else(Error::closed)?;

        file.seek(SeekFrom::Start(offset)).await?;
        read_once(file, buf).await
    }

    async fn size(&self) -> Result<u64> {
        let file = self.file.lock().await;
        let file = file.as_ref().ok_or_else(Error::closed)?;
        Ok(file.metadata().await?.len())
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush().await?;
            event!(Level::TRACE, "Closed {:?}", self.path);
        }
        Ok(())
    }
}

#[async_trait]
impl SequentialWrite for LocalFile {
    async fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut file = self.file.lock().await;
        let file = file.as_mut().ok_or_else(Error::closed)?;

        file.write_all(buf).await?;
        Ok(buf.len())
    }

    async fn close(&self) -> Result<()> {
        RandomAccess::close(self).await
    }
}
