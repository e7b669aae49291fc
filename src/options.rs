use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Default block size for uploads, 4 MiB,
///
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Default capacity of the pipe feeding an upload,
///
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Default number of transport retries the blob client makes per request,
///
pub const DEFAULT_MAX_RETRIES: u32 = 8;

/// Default number of observed calls between accounting reports,
///
pub const DEFAULT_REPORT_INTERVAL: u64 = 10_000;

/// Settings shared by every handle an opener creates,
///
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Budget for a size probe or a range open, zero disables the timeout,
    ///
    pub open_timeout: Duration,
    /// Transport retries the blob client makes per request, zero disables retries,
    ///
    pub max_retries: u32,
    /// Size of each staged block when uploading,
    ///
    pub block_size: usize,
    /// Capacity of the duplex pipe between a writer and its upload task,
    ///
    pub pipe_capacity: usize,
    /// Enables read accounting on remote readers,
    ///
    pub accounting: bool,
    /// Number of observed calls between accounting reports,
    ///
    pub report_interval: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            open_timeout: Duration::ZERO,
            max_retries: DEFAULT_MAX_RETRIES,
            block_size: DEFAULT_BLOCK_SIZE,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            accounting: false,
            report_interval: DEFAULT_REPORT_INTERVAL,
        }
    }
}

impl Options {
    /// Sets the open timeout,
    ///
    pub fn with_open_timeout(mut self, open_timeout: Duration) -> Self {
        self.open_timeout = open_timeout;
        self
    }

    /// Sets the number of transport retries,
    ///
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the upload block size, clamped to at least one byte,
    ///
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Sets the upload pipe capacity, clamped to at least one byte,
    ///
    pub fn with_pipe_capacity(mut self, pipe_capacity: usize) -> Self {
        self.pipe_capacity = pipe_capacity.max(1);
        self
    }

    /// Enables read accounting, reporting every `report_interval` calls,
    ///
    pub fn with_accounting(mut self, report_interval: u64) -> Self {
        self.accounting = true;
        self.report_interval = report_interval.max(1);
        self
    }
}

/// Parses options from toml, missing keys keep their defaults,
///
impl FromStr for Options {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).map_err(|err| Error::InvalidOptions(err.to_string()))
    }
}

#[test]
fn test_options_builder() {
    let options = Options::default()
        .with_open_timeout(Duration::from_secs(5))
        .with_max_retries(2)
        .with_block_size(0)
        .with_pipe_capacity(1024)
        .with_accounting(100);

    assert_eq!(options.open_timeout, Duration::from_secs(5));
    assert_eq!(options.block_size, 1);
    assert_eq!(options.pipe_capacity, 1024);
    assert_eq!(options.max_retries, 2);
    assert!(options.accounting);
    assert_eq!(options.report_interval, 100);
    assert_eq!(Options::default().open_timeout, Duration::ZERO);
}

#[test]
fn test_options_from_toml() {
    let options: Options = r#"
block_size = 1048576
accounting = true

[open_timeout]
secs = 30
nanos = 0
"#
    .parse()
    .expect("should parse");

    assert_eq!(options.block_size, 1024 * 1024);
    assert!(options.accounting);
    assert_eq!(options.open_timeout, Duration::from_secs(30));
    assert_eq!(options.pipe_capacity, DEFAULT_PIPE_CAPACITY);
    assert_eq!(options.max_retries, DEFAULT_MAX_RETRIES);

    let saved = toml::to_string(&options).expect("should serialize");
    assert_eq!(saved.parse::<Options>().ok(), Some(options));

    assert!(matches!(
        "block_size = \"large\"".parse::<Options>(),
        Err(Error::InvalidOptions(_))
    ));
}
