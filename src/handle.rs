use async_trait::async_trait;

use crate::{Error, Result};

/// Reference point for a seek,
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// Relative to the start of the object,
    ///
    Start,
    /// Relative to the current cursor,
    ///
    Current,
    /// Relative to the end of the object,
    ///
    End,
}

/// Outcome of a successful read,
///
/// End of stream is a distinct, non-error outcome so callers can tell a short read apart from
/// the end of the object,
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Number of bytes copied into the buffer, may be fewer than requested,
    ///
    Bytes(usize),
    /// The cursor is at or past the end of the object,
    ///
    EndOfStream,
}

impl ReadOutcome {
    /// Returns the number of bytes read,
    ///
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            ReadOutcome::Bytes(n) => *n,
            ReadOutcome::EndOfStream => 0,
        }
    }

    /// Returns true if nothing was read,
    ///
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the end of the object was reached,
    ///
    #[inline]
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, ReadOutcome::EndOfStream)
    }
}

/// Trait for handles w/ local-file style random access,
///
/// Every method takes `&self`, implementations serialize calls internally so a handle can be
/// shared between tasks,
///
#[async_trait]
pub trait RandomAccess: Send + Sync {
    /// Reads up to `buf.len()` bytes at the cursor and advances it,
    ///
    async fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome>;

    /// Moves the cursor and returns the new absolute offset,
    ///
    async fn seek(&self, offset: i64, whence: Whence) -> Result<u64>;

    /// Reads at an absolute offset, leaving the cursor after the bytes read,
    ///
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<ReadOutcome>;

    /// Returns the total size of the object,
    ///
    async fn size(&self) -> Result<u64>;

    /// Releases the handle's resources, closing twice is a no-op,
    ///
    async fn close(&self) -> Result<()>;

    /// Reads from the cursor until end of stream, appending to `out`,
    ///
    async fn read_to_end(&self, out: &mut Vec<u8>) -> Result<usize> {
        let mut buf = vec![0; 64 * 1024];
        let mut total = 0;
        loop {
            match self.read(&mut buf).await? {
                ReadOutcome::Bytes(n) => {
                    out.extend_from_slice(&buf[..n]);
                    total += n;
                }
                ReadOutcome::EndOfStream => return Ok(total),
            }
        }
    }
}

/// Trait for handles that accept sequential writes,
///
#[async_trait]
pub trait SequentialWrite: Send + Sync {
    /// Writes all of `buf` and returns its length,
    ///
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Finishes the write and reports its outcome,
    ///
    async fn close(&self) -> Result<()>;
}

/// Resolves `base + offset` to an absolute cursor,
///
/// Negative targets are rejected before any state is touched,
///
pub(crate) fn resolve_target(base: u64, offset: i64) -> Result<u64> {
    let target = base as i128 + offset as i128;
    u64::try_from(target).map_err(|_| Error::OutOfRange { target })
}

#[test]
fn test_resolve_target() {
    assert_eq!(resolve_target(100, -5).ok(), Some(95));
    assert_eq!(resolve_target(0, 130).ok(), Some(130));
    assert!(matches!(
        resolve_target(0, -5),
        Err(Error::OutOfRange { target: -5 })
    ));
    assert!(matches!(
        resolve_target(u64::MAX, i64::MAX),
        Err(Error::OutOfRange { .. })
    ));
}
