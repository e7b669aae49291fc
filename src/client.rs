use std::io;

use async_trait::async_trait;
use tokio::io::AsyncRead;

mod memory;
pub use memory::MemoryClient;
pub use memory::MemoryRange;

mod file_client;
pub use file_client::FileClient;

mod azure;
pub use azure::AzureBlobClient;
pub use azure::AzureRangeStream;
pub use azure::StaticToken;
pub use azure_core::auth::TokenCredential;

/// Type alias for the source an upload client consumes,
///
pub type UploadSource = Box<dyn AsyncRead + Send + Unpin + 'static>;

/// Trait to enable different range-fetch backends for a single remote object,
///
/// Every call is independent, the client keeps no cursor of its own,
///
#[async_trait]
pub trait RangeClient: Send + Sync + 'static {
    /// Forward-only stream returned for an open range, ex. an http body, a duplex, etc,
    ///
    type Stream: AsyncRead + Unpin + Send + 'static;

    /// Returns the total size of the object, or None if the store doesn't report one,
    ///
    async fn probe_size(&self) -> io::Result<Option<u64>>;

    /// Returns a stream that yields exactly the bytes in `[offset, offset + count)`,
    ///
    async fn open_range(&self, offset: u64, count: u64) -> io::Result<Self::Stream>;

    /// Returns a label for the object, used in errors and logs,
    ///
    fn describe(&self) -> String {
        String::from("remote object")
    }
}

/// Trait to enable different backends for one-shot uploads,
///
#[async_trait]
pub trait UploadClient: Send + Sync + 'static {
    /// Consumes `source` to completion as the new object body, returning the bytes uploaded,
    ///
    async fn upload(&self, source: UploadSource) -> io::Result<u64>;
}
