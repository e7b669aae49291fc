mod error;
pub use error::Error;
pub use error::Result;

mod handle;
pub use handle::RandomAccess;
pub use handle::ReadOutcome;
pub use handle::SequentialWrite;
pub use handle::Whence;

mod options;
pub use options::Options;
pub use options::DEFAULT_BLOCK_SIZE;
pub use options::DEFAULT_MAX_RETRIES;
pub use options::DEFAULT_PIPE_CAPACITY;
pub use options::DEFAULT_REPORT_INTERVAL;

mod locator;
pub use locator::BlobLocator;
pub use locator::BLOB_HOST_SUFFIX;

mod client;
pub use client::AzureBlobClient;
pub use client::AzureRangeStream;
pub use client::FileClient;
pub use client::MemoryClient;
pub use client::MemoryRange;
pub use client::RangeClient;
pub use client::StaticToken;
pub use client::TokenCredential;
pub use client::UploadClient;
pub use client::UploadSource;

mod accounting;
pub use accounting::AccountingSnapshot;
pub use accounting::ReadAccounting;
pub use accounting::ReadAtPath;
pub use accounting::ReadObserver;

mod reader;
pub use reader::BlobReader;

mod writer;
pub use writer::BlobWriter;

mod local;
pub use local::LocalFile;

mod opener;
pub use opener::BoxReader;
pub use opener::BoxWriter;
pub use opener::Opener;
pub use opener::BLOB_SCHEME;
pub use opener::FILE_SCHEME;

pub mod prelude {
    pub use crate::Error;
    pub use crate::Opener;
    pub use crate::Options;
    pub use crate::RandomAccess;
    pub use crate::ReadOutcome;
    pub use crate::Result;
    pub use crate::SequentialWrite;
    pub use crate::Whence;
}
