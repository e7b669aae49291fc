use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{event, Level};

/// Which path a read-at call took,
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAtPath {
    /// The offset matched the cursor and a range was already open,
    ///
    Fast,
    /// A seek (and usually a new range) was needed,
    ///
    Slow,
}

/// Trait for observing reader activity,
///
/// Observers are diagnostic only, a reader behaves the same w/ or w/o one,
///
pub trait ReadObserver: Send + Sync + 'static {
    /// Called for every read w/ the size of the caller's buffer,
    ///
    fn on_read(&self, requested: usize) {
        let _ = requested;
    }

    /// Called for every read-at w/ the path it took,
    ///
    fn on_read_at(&self, path: ReadAtPath) {
        let _ = path;
    }
}

/// Number of power-of-two buckets tracked for read sizes,
///
const BUCKETS: usize = usize::BITS as usize;

/// Observer that keeps a histogram of read sizes and read-at path counts,
///
/// A summary is reported through tracing every `report_interval` calls,
///
pub struct ReadAccounting {
    read_sizes: [AtomicU64; BUCKETS],
    reads: AtomicU64,
    read_at_fast: AtomicU64,
    read_at_slow: AtomicU64,
    report_interval: u64,
}

/// Point in time copy of a read accounting's counters,
///
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountingSnapshot {
    /// Total reads observed,
    ///
    pub reads: u64,
    /// Non-empty buckets as (power-of-two size, count), largest first,
    ///
    pub read_sizes: Vec<(u64, u64)>,
    /// Read-at calls served w/o a seek,
    ///
    pub read_at_fast: u64,
    /// Read-at calls that needed a seek,
    ///
    pub read_at_slow: u64,
}

impl ReadAccounting {
    /// Returns a new accounting observer,
    ///
    pub fn new(report_interval: u64) -> Self {
        Self {
            read_sizes: std::array::from_fn(|_| AtomicU64::new(0)),
            reads: AtomicU64::new(0),
            read_at_fast: AtomicU64::new(0),
            read_at_slow: AtomicU64::new(0),
            report_interval: report_interval.max(1),
        }
    }

    /// Returns a copy of the current counters,
    ///
    pub fn snapshot(&self) -> AccountingSnapshot {
        let read_sizes = (0..BUCKETS)
            .rev()
            .filter_map(|bucket| {
                let count = self.read_sizes[bucket].load(Ordering::Relaxed);
                (count > 0).then_some((1u64 << bucket, count))
            })
            .collect();

        AccountingSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            read_sizes,
            read_at_fast: self.read_at_fast.load(Ordering::Relaxed),
            read_at_slow: self.read_at_slow.load(Ordering::Relaxed),
        }
    }

    /// Reports the current counters,
    ///
    fn report(&self) {
        let snapshot = self.snapshot();
        event!(
            Level::INFO,
            reads = snapshot.reads,
            read_at_fast = snapshot.read_at_fast,
            read_at_slow = snapshot.read_at_slow,
            "Read distribution {:?}",
            snapshot.read_sizes
        );
    }
}

impl Default for ReadAccounting {
    fn default() -> Self {
        Self::new(crate::options::DEFAULT_REPORT_INTERVAL)
    }
}

impl ReadObserver for ReadAccounting {
    fn on_read(&self, requested: usize) {
        if requested > 0 {
            let bucket = (usize::BITS - 1 - requested.leading_zeros()) as usize;
            self.read_sizes[bucket].fetch_add(1, Ordering::Relaxed);
        }

        let reads = self.reads.fetch_add(1, Ordering::Relaxed) + 1;
        if reads % self.report_interval == 0 {
            self.report();
        }
    }

    fn on_read_at(&self, path: ReadAtPath) {
        match path {
            ReadAtPath::Fast => self.read_at_fast.fetch_add(1, Ordering::Relaxed),
            ReadAtPath::Slow => self.read_at_slow.fetch_add(1, Ordering::Relaxed),
        };

        let calls = self.read_at_fast.load(Ordering::Relaxed) + self.read_at_slow.load(Ordering::Relaxed);
        if calls % self.report_interval == 0 {
            self.report();
        }
    }
}

#[test]
#[tracing_test::traced_test]
fn test_read_accounting() {
    let accounting = ReadAccounting::new(4);

    for size in [0, 1, 3, 4096, 5000] {
        accounting.on_read(size);
    }
    accounting.on_read_at(ReadAtPath::Fast);
    accounting.on_read_at(ReadAtPath::Fast);
    accounting.on_read_at(ReadAtPath::Slow);

    let snapshot = accounting.snapshot();
    assert_eq!(snapshot.reads, 5);
    assert_eq!(snapshot.read_sizes, vec![(4096, 2), (2, 1), (1, 1)]);
    assert_eq!(snapshot.read_at_fast, 2);
    assert_eq!(snapshot.read_at_slow, 1);

    assert!(logs_contain("Read distribution"));
}
