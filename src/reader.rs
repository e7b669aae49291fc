use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{event, Level};

use crate::accounting::{ReadAtPath, ReadObserver};
use crate::handle::resolve_target;
use crate::{Error, RandomAccess, RangeClient, ReadOutcome, Result, Whence};

/// Largest chunk discarded per read while fast-forwarding,
///
const SKIP_CHUNK: u64 = 32 * 1024;

/// State of the reader's range session,
///
enum Session<S> {
    /// An open stream covering `[cursor, size)`,
    ///
    Open(S),
    /// No stream is open, ex. the cursor is at or past the end,
    ///
    Idle,
    /// Opening (or reading) a range failed, reads return this error until the next
    /// successful seek,
    ///
    Errored(Error),
}

/// Cursor and session, only ever touched while the reader's lock is held,
///
struct State<S> {
    cursor: u64,
    session: Session<S>,
}

/// Struct that presents a remote object as a seekable, readable file,
///
/// The reader keeps at most one range session open. Reads consume that session in order,
/// forward seeks relative to the cursor discard bytes from it, and every other seek drops it and
/// opens a new range at the target. A single lock serializes all calls, so a reader can be
/// shared by several tasks,
///
pub struct BlobReader<C>
where
    C: RangeClient,
{
    /// Range client for the object,
    ///
    client: C,
    /// Size of the object, fixed at open,
    ///
    size: u64,
    /// Cursor and session,
    ///
    state: Mutex<State<C::Stream>>,
    /// Optional diagnostics,
    ///
    observer: Option<Arc<dyn ReadObserver>>,
}

impl<C> BlobReader<C>
where
    C: RangeClient,
{
    /// Probes the object's size and opens a range at the start of the object,
    ///
    pub async fn open(client: C) -> Result<Self> {
        let size = match client.probe_size().await {
            Ok(Some(size)) => size,
            Ok(None) => {
                return Err(Error::backend(
                    "probe size",
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "object size is unknown"),
                ))
            }
            Err(err) => return Err(Error::probe(client.describe(), err)),
        };

        let reader = Self {
            client,
            size,
            state: Mutex::new(State {
                cursor: 0,
                session: Session::Idle,
            }),
            observer: None,
        };

        {
            let mut state = reader.state.lock().await;
            reader.reposition(&mut state, 0).await?;
        }

        event!(Level::DEBUG, "Opened {}, {size} bytes", reader.client.describe());
        Ok(reader)
    }

    /// Attaches an observer,
    ///
    pub fn with_observer(mut self, observer: Arc<dyn ReadObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Returns a reference to the range client,
    ///
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the current cursor,
    ///
    pub async fn position(&self) -> u64 {
        self.state.lock().await.cursor
    }

    /// Returns true if a range session is currently open,
    ///
    pub async fn has_session(&self) -> bool {
        matches!(self.state.lock().await.session, Session::Open(_))
    }

    /// Reads from the open session,
    ///
    async fn read_locked(&self, state: &mut State<C::Stream>, buf: &mut [u8]) -> Result<ReadOutcome> {
        if let Some(observer) = self.observer.as_ref() {
            observer.on_read(buf.len());
        }

        if buf.is_empty() {
            return Ok(ReadOutcome::Bytes(0));
        }

        if state.cursor >= self.size {
            return Ok(ReadOutcome::EndOfStream);
        }

        let read = match &mut state.session {
            Session::Open(stream) => stream.read(buf).await,
            Session::Errored(err) => return Err(err.clone()),
            Session::Idle => {
                return Err(Error::InternalInconsistency(format!(
                    "no open range at offset {} of {}",
                    state.cursor, self.size
                )))
            }
        };

        match read {
            Ok(0) => {
                state.session = Session::Idle;
                Err(Error::InternalInconsistency(format!(
                    "range ended at offset {} before the end of the object at {}",
                    state.cursor, self.size
                )))
            }
            Ok(n) => {
                state.cursor += n as u64;
                if state.cursor >= self.size {
                    event!(Level::TRACE, "Range fully consumed, closing");
                    state.session = Session::Idle;
                }
                Ok(ReadOutcome::Bytes(n))
            }
            Err(err) => {
                let err = Error::backend("read range", err);
                event!(Level::WARN, "Read at {} failed, {err}", state.cursor);
                state.session = Session::Errored(err.clone());
                Err(err)
            }
        }
    }

    /// Moves the cursor,
    ///
    async fn seek_locked(&self, state: &mut State<C::Stream>, offset: i64, whence: Whence) -> Result<u64> {
        match whence {
            Whence::Start => {
                let target = resolve_target(0, offset)?;
                self.reposition(state, target).await
            }
            Whence::End => {
                let target = resolve_target(self.size, offset)?;
                self.reposition(state, target).await
            }
            Whence::Current => {
                let target = resolve_target(state.cursor, offset)?;
                let open = matches!(state.session, Session::Open(_));

                if offset >= 0 && open && target < self.size {
                    self.fast_forward(state, target).await
                } else {
                    self.reposition(state, target).await
                }
            }
        }
    }

    /// Discards bytes from the open session up to `target` instead of opening a new range,
    ///
    /// The cursor advances after every chunk, so if the call is dropped part way the cursor still
    /// matches the session,
    ///
    async fn fast_forward(&self, state: &mut State<C::Stream>, target: u64) -> Result<u64> {
        let mut scratch = vec![0; (target - state.cursor).min(SKIP_CHUNK) as usize];

        while state.cursor < target {
            let want = (target - state.cursor).min(scratch.len() as u64) as usize;
            let read = match &mut state.session {
                Session::Open(stream) => stream.read(&mut scratch[..want]).await,
                _ => {
                    return Err(Error::InternalInconsistency(format!(
                        "fast-forward w/o an open range at offset {}",
                        state.cursor
                    )))
                }
            };

            match read {
                Ok(0) => {
                    state.session = Session::Idle;
                    return Err(Error::InternalInconsistency(format!(
                        "range ended at offset {} while skipping to {target}",
                        state.cursor
                    )));
                }
                Ok(n) => state.cursor += n as u64,
                Err(err) => {
                    let err = Error::backend("skip range", err);
                    state.session = Session::Errored(err.clone());
                    return Err(err);
                }
            }
        }

        event!(Level::TRACE, "Fast-forwarded to {}", state.cursor);
        Ok(state.cursor)
    }

    /// Drops any open session and positions the cursor at `target`,
    ///
    /// A new range is only opened if `target` is before the end of the object. If the open fails
    /// the cursor still moves to `target` and the error becomes sticky,
    ///
    async fn reposition(&self, state: &mut State<C::Stream>, target: u64) -> Result<u64> {
        if let Session::Open(_) = std::mem::replace(&mut state.session, Session::Idle) {
            event!(Level::DEBUG, "Closing range at offset {}", state.cursor);
        }
        state.cursor = target;

        if target >= self.size {
            return Ok(target);
        }

        match self.client.open_range(target, self.size - target).await {
            Ok(stream) => {
                event!(Level::DEBUG, "Opened range {target}..{}", self.size);
                state.session = Session::Open(stream);
                Ok(target)
            }
            Err(err) => {
                let err = Error::backend("open range", err);
                event!(Level::WARN, "Could not open range at {target}, {err}");
                state.session = Session::Errored(err.clone());
                Err(err)
            }
        }
    }
}

#[async_trait]
impl<C> RandomAccess for BlobReader<C>
where
    C: RangeClient,
{
    async fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        let mut state = self.state.lock().await;
        self.read_locked(&mut state, buf).await
    }

    async fn seek(&self, offset: i64, whence: Whence) -> Result<u64> {
        let mut state = self.state.lock().await;
        self.seek_locked(&mut state, offset, whence).await
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<ReadOutcome> {
        let mut state = self.state.lock().await;

        if offset == state.cursor && matches!(state.session, Session::Open(_)) {
            if let Some(observer) = self.observer.as_ref() {
                observer.on_read_at(ReadAtPath::Fast);
            }
            return self.read_locked(&mut state, buf).await;
        }

        if let Some(observer) = self.observer.as_ref() {
            observer.on_read_at(ReadAtPath::Slow);
        }
        self.reposition(&mut state, offset).await?;
        self.read_locked(&mut state, buf).await
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Session::Open(_) = std::mem::replace(&mut state.session, Session::Idle) {
            event!(Level::DEBUG, "Closing range at offset {}", state.cursor);
        }
        state.cursor = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryClient, ReadAccounting};
    use futures::FutureExt;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, ReadBuf};

    /// Range client whose streams yield 4 bytes, then stall once before the next 4,
    ///
    struct StallingClient(Vec<u8>);

    struct StallingRange {
        data: Vec<u8>,
        pos: usize,
        stall: bool,
    }

    impl AsyncRead for StallingRange {
        fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            if this.stall {
                this.stall = false;
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }

            let end = (this.pos + 4).min(this.data.len()).min(this.pos + buf.remaining());
            buf.put_slice(&this.data[this.pos..end]);
            this.pos = end;
            this.stall = true;
            Poll::Ready(Ok(()))
        }
    }

    #[async_trait]
    impl RangeClient for StallingClient {
        type Stream = StallingRange;

        async fn probe_size(&self) -> io::Result<Option<u64>> {
            Ok(Some(self.0.len() as u64))
        }

        async fn open_range(&self, offset: u64, count: u64) -> io::Result<Self::Stream> {
            let start = offset as usize;
            Ok(StallingRange {
                data: self.0[start..start + count as usize].to_vec(),
                pos: 0,
                stall: false,
            })
        }
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn open(len: usize) -> BlobReader<MemoryClient> {
        BlobReader::open(MemoryClient::new(content(len)).with_frame_size(7))
            .await
            .expect("should open")
    }

    async fn read_rest(reader: &BlobReader<MemoryClient>) -> Vec<u8> {
        let mut out = vec![];
        reader.read_to_end(&mut out).await.expect("should read");
        out
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_read_from_every_offset() {
        let reference = content(100);
        let reader = open(100).await;

        for offset in [0, 1, 6, 7, 50, 99, 100] {
            assert_eq!(reader.seek(offset as i64, Whence::Start).await.ok(), Some(offset as u64));
            assert_eq!(read_rest(&reader).await, &reference[offset..], "offset {offset}");
        }
    }

    #[tokio::test]
    async fn test_short_reads() {
        let reader = open(100).await;

        let mut buf = [0; 64];
        assert_eq!(reader.read(&mut buf).await.ok(), Some(ReadOutcome::Bytes(7)));
        assert_eq!(reader.position().await, 7);
    }

    #[tokio::test]
    async fn test_zero_length_read() {
        let reader = open(10).await;

        assert_eq!(reader.read(&mut []).await.ok(), Some(ReadOutcome::Bytes(0)));
        reader.seek(0, Whence::End).await.expect("should seek");
        assert_eq!(reader.read(&mut []).await.ok(), Some(ReadOutcome::Bytes(0)));
        assert_eq!(reader.read(&mut [0; 4]).await.ok(), Some(ReadOutcome::EndOfStream));
    }

    #[tokio::test]
    async fn test_end_of_stream_does_not_reopen() {
        let reader = open(20).await;
        read_rest(&reader).await;

        let opens = reader.client().range_opens();
        assert!(!reader.has_session().await);
        for _ in 0..5 {
            assert_eq!(reader.read(&mut [0; 8]).await.ok(), Some(ReadOutcome::EndOfStream));
        }
        assert_eq!(reader.client().range_opens(), opens);
    }

    #[tokio::test]
    async fn test_seek_past_end() {
        let reader = open(100).await;
        let opens = reader.client().range_opens();

        assert_eq!(reader.seek(130, Whence::Start).await.ok(), Some(130));
        assert_eq!(reader.read(&mut [0; 8]).await.ok(), Some(ReadOutcome::EndOfStream));
        assert_eq!(reader.client().range_opens(), opens);

        assert_eq!(reader.seek(30, Whence::End).await.ok(), Some(130));
        assert_eq!(reader.seek(5, Whence::Current).await.ok(), Some(135));
        assert_eq!(reader.client().range_opens(), opens);
    }

    #[tokio::test]
    async fn test_negative_seek_leaves_cursor() {
        let reader = open(100).await;
        reader.seek(40, Whence::Start).await.expect("should seek");
        let opens = reader.client().range_opens();

        assert!(matches!(
            reader.seek(-5, Whence::Start).await,
            Err(Error::OutOfRange { target: -5 })
        ));
        assert!(matches!(
            reader.seek(-101, Whence::End).await,
            Err(Error::OutOfRange { target: -1 })
        ));
        assert!(matches!(
            reader.seek(-41, Whence::Current).await,
            Err(Error::OutOfRange { target: -1 })
        ));

        assert_eq!(reader.position().await, 40);
        assert!(reader.has_session().await);
        assert_eq!(reader.client().range_opens(), opens);
        assert_eq!(read_rest(&reader).await, &content(100)[40..]);
    }

    #[tokio::test]
    async fn test_start_and_end_agree() {
        let reference = content(100);

        for target in [0, 1, 42, 99, 100, 101, 250] {
            let by_start = open(100).await;
            let by_end = open(100).await;

            let a = by_start.seek(target, Whence::Start).await.expect("should seek");
            let b = by_end.seek(target - 100, Whence::End).await.expect("should seek");
            assert_eq!(a, b);

            let (a, b) = (read_rest(&by_start).await, read_rest(&by_end).await);
            assert_eq!(a, b);
            assert_eq!(a, reference.get(target as usize..).unwrap_or_default());
        }
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_fast_forward() {
        let reader = open(100).await;
        let mut buf = [0; 5];
        reader.read(&mut buf).await.expect("should read");
        let opens = reader.client().range_opens();

        assert_eq!(reader.seek(30, Whence::Current).await.ok(), Some(35));
        assert_eq!(reader.client().range_opens(), opens);
        assert_eq!(read_rest(&reader).await, &content(100)[35..]);
    }

    #[tokio::test]
    async fn test_cancelled_fast_forward_keeps_cursor() {
        let reference = content(100);
        let reader = BlobReader::open(StallingClient(reference.clone()))
            .await
            .expect("should open");

        // Skips one chunk, then the stream stalls and the seek is dropped
        assert!(reader.seek(40, Whence::Current).now_or_never().is_none());
        assert_eq!(reader.position().await, 4);
        assert!(reader.has_session().await);

        let mut out = vec![];
        reader.read_to_end(&mut out).await.expect("should read");
        assert_eq!(out, &reference[4..]);
    }

    #[tokio::test]
    async fn test_current_matches_start() {
        let reference = content(100);

        for (first, skip) in [(0, 0), (0, 10), (10, 89), (10, 90), (13, 0)] {
            // With a session open
            let forward = open(100).await;
            forward.seek(first, Whence::Start).await.expect("should seek");
            assert!(forward.has_session().await);
            let a = forward.seek(skip, Whence::Current).await.expect("should seek");

            // Without a session, close resets the cursor to zero
            let reopened = open(100).await;
            reopened.seek(500, Whence::Start).await.expect("should seek");
            reopened.close().await.expect("should close");
            assert!(!reopened.has_session().await);
            let b = reopened
                .seek(first + skip, Whence::Current)
                .await
                .expect("should seek");

            let absolute = open(100).await;
            let c = absolute.seek(first + skip, Whence::Start).await.expect("should seek");

            assert_eq!(a, c);
            assert_eq!(b, c);
            let expected = &reference[(first + skip) as usize..];
            assert_eq!(read_rest(&forward).await, expected);
            assert_eq!(read_rest(&reopened).await, expected);
            assert_eq!(read_rest(&absolute).await, expected);
        }
    }

    #[tokio::test]
    async fn test_backward_seek_reopens() {
        let reader = open(100).await;
        reader.seek(50, Whence::Start).await.expect("should seek");
        let opens = reader.client().range_opens();

        assert_eq!(reader.seek(-20, Whence::Current).await.ok(), Some(30));
        assert_eq!(reader.client().range_opens(), opens + 1);
        assert_eq!(read_rest(&reader).await, &content(100)[30..]);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_sticky_open_error() {
        let reader = open(100).await;
        reader.client().fail_next_opens(1);

        let err = reader.seek(60, Whence::Start).await.expect_err("should fail");
        assert!(matches!(err, Error::Backend { op: "open range", .. }));
        assert_eq!(reader.position().await, 60);

        for _ in 0..3 {
            let err = reader.read(&mut [0; 4]).await.expect_err("should stay failed");
            assert!(err.is_backend());
        }
        assert!(matches!(
            reader.read_at(&mut [0; 4], 60).await,
            Ok(ReadOutcome::Bytes(4))
        ));
        reader.seek(60, Whence::Start).await.expect("should seek");
        assert_eq!(read_rest(&reader).await, &content(100)[60..]);
        assert!(logs_contain("Could not open range"));
    }

    #[tokio::test]
    async fn test_sticky_error_cleared_by_seek_past_end() {
        let reader = open(100).await;
        reader.client().fail_next_opens(1);
        reader.seek(10, Whence::Start).await.expect_err("should fail");

        assert_eq!(reader.seek(100, Whence::Start).await.ok(), Some(100));
        assert_eq!(reader.read(&mut [0; 4]).await.ok(), Some(ReadOutcome::EndOfStream));
    }

    #[tokio::test]
    async fn test_read_after_close_is_inconsistent() {
        let reader = open(100).await;
        reader.seek(30, Whence::Start).await.expect("should seek");

        reader.close().await.expect("should close");
        reader.close().await.expect("second close is a no-op");
        assert_eq!(reader.position().await, 0);
        assert!(!reader.has_session().await);

        assert!(matches!(
            reader.read(&mut [0; 4]).await,
            Err(Error::InternalInconsistency(_))
        ));

        reader.seek(0, Whence::Start).await.expect("should reopen");
        assert_eq!(read_rest(&reader).await, content(100));
    }

    #[tokio::test]
    async fn test_read_at_paths() {
        let reference = content(100);
        let accounting = Arc::new(ReadAccounting::default());
        let reader = open(100).await.with_observer(accounting.clone());

        let mut buf = [0; 10];
        let n = reader.read_at(&mut buf, 0).await.expect("should read").len();
        assert_eq!(&buf[..n], &reference[..n]);

        let cursor = reader.position().await;
        let opens = reader.client().range_opens();
        let n = reader.read_at(&mut buf, cursor).await.expect("should read").len();
        assert_eq!(&buf[..n], &reference[cursor as usize..cursor as usize + n]);
        assert_eq!(reader.client().range_opens(), opens);

        let n = reader.read_at(&mut buf, 80).await.expect("should read").len();
        assert_eq!(&buf[..n], &reference[80..80 + n]);
        assert_eq!(reader.client().range_opens(), opens + 1);

        assert_eq!(
            reader.read_at(&mut buf, 100).await.ok(),
            Some(ReadOutcome::EndOfStream)
        );

        let snapshot = accounting.snapshot();
        assert_eq!(snapshot.read_at_fast, 2);
        assert_eq!(snapshot.read_at_slow, 2);
        assert_eq!(snapshot.reads, 4);
    }

    #[tokio::test]
    async fn test_read_at_matches_seek_then_read() {
        let reference = content(100);

        for offset in [0u64, 3, 7, 64, 99] {
            let a = open(100).await;
            let b = open(100).await;
            a.seek(offset as i64, Whence::Start).await.expect("should seek");
            b.seek(offset as i64, Whence::Start).await.expect("should seek");

            let (mut buf_a, mut buf_b) = ([0; 16], [0; 16]);
            let n_a = a.read_at(&mut buf_a, offset).await.expect("should read");
            b.seek(offset as i64, Whence::Start).await.expect("should seek");
            let n_b = b.read(&mut buf_b).await.expect("should read");

            assert_eq!(n_a, n_b);
            assert_eq!(&buf_a[..n_a.len()], &reference[offset as usize..offset as usize + n_a.len()]);
            assert_eq!(buf_a, buf_b);
        }
    }

    #[tokio::test]
    async fn test_empty_object() {
        let reader = BlobReader::open(MemoryClient::new(Vec::<u8>::new()))
            .await
            .expect("should open");

        assert_eq!(reader.size().await.ok(), Some(0));
        assert_eq!(reader.client().range_opens(), 0);
        assert_eq!(reader.read(&mut [0; 4]).await.ok(), Some(ReadOutcome::EndOfStream));
    }

    #[tokio::test]
    async fn test_missing_object() {
        let result = BlobReader::open(MemoryClient::default()).await;
        assert!(matches!(result, Err(Error::NotFound(ref name)) if name.starts_with("memory object")));

        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("missing.bin");
        match BlobReader::open(crate::FileClient::new(&path)).await {
            Err(Error::NotFound(name)) => assert!(name.contains("missing.bin")),
            Err(err) => panic!("unexpected error {err}"),
            Ok(_) => panic!("should not open"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls() {
        let reference = Arc::new(content(4096));
        let reader = Arc::new(
            BlobReader::open(MemoryClient::new(content(4096)).with_frame_size(13))
                .await
                .expect("should open"),
        );

        let mut tasks = vec![];
        for worker in 0..8u64 {
            let reader = reader.clone();
            let reference = reference.clone();
            tasks.push(tokio::spawn(async move {
                for round in 0..32u64 {
                    let offset = (worker * 509 + round * 61) % 4096;
                    let mut buf = [0; 32];
                    let n = reader
                        .read_at(&mut buf, offset)
                        .await
                        .expect("should read")
                        .len();
                    assert_eq!(&buf[..n], &reference[offset as usize..offset as usize + n]);
                    if round % 5 == 0 {
                        reader.seek(3, Whence::Current).await.expect("should seek");
                    }
                }
            }));
        }

        for task in tasks {
            task.await.expect("task should complete");
        }

        reader.seek(4000, Whence::Start).await.expect("should seek");
        assert_eq!(read_rest(&reader).await, &reference[4000..]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_relative_calls_replay_serially() {
        let reader = Arc::new(open(10_000).await);

        let mut tasks = vec![];
        for worker in 0..8u64 {
            let reader = reader.clone();
            tasks.push(tokio::spawn(async move {
                let mut moved = 0;
                for round in 0..25u64 {
                    let step = (worker + round) % 4;
                    reader.seek(step as i64, Whence::Current).await.expect("should seek");
                    moved += step;

                    let mut buf = [0; 5];
                    let n = reader.read(&mut buf).await.expect("should read").len();
                    // Bytes returned by one read are contiguous in the object
                    for pair in buf[..n].windows(2) {
                        assert_eq!(pair[1] as usize, (pair[0] as usize + 1) % 251);
                    }
                    moved += n as u64;
                    tokio::task::yield_now().await;
                }
                moved
            }));
        }

        let mut expected = 0;
        for task in tasks {
            expected += task.await.expect("task should complete");
        }
        assert_eq!(reader.position().await, expected);
        assert_eq!(read_rest(&reader).await, &content(10_000)[expected as usize..]);
    }
}
