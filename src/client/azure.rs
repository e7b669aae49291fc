use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use azure_core::auth::{AccessToken, TokenCredential};
use azure_core::error::ErrorKind;
use azure_core::request_options::Range;
use azure_core::{ExponentialRetryOptions, RetryOptions, StatusCode};
use azure_storage::{CloudLocation, StorageCredentials};
use azure_storage_blobs::prelude::{BlobBlockType, BlobClient, BlockId, BlockList, ClientBuilder};
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tracing::{event, Level};

use crate::{BlobLocator, Options};

use super::{RangeClient, UploadClient, UploadSource};

/// Type-alias for a download body mapped to io errors,
///
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Type-alias for the stream returned for an open range,
///
pub type AzureRangeStream = StreamReader<BodyStream, Bytes>;

/// Credential that always returns the same bearer token,
///
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Returns a new static token credential,
    ///
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StaticToken").field(&"<redacted>").finish()
    }
}

#[async_trait]
impl TokenCredential for StaticToken {
    async fn get_token(&self, _: &[&str]) -> azure_core::Result<AccessToken> {
        Ok(AccessToken::new(
            self.0.clone(),
            time::OffsetDateTime::now_utc() + time::Duration::hours(1),
        ))
    }

    async fn clear_cache(&self) -> azure_core::Result<()> {
        Ok(())
    }
}

/// Range and upload client for a single blob in the Azure blob service,
///
/// - size probe is a get properties request,
/// - ranges are ranged downloads, fetched in chunks by the sdk's pageable,
/// - uploads stage `block_size` blocks and then commit the block list,
///
/// Transient transport failures are retried by the blob client's pipeline,
///
#[derive(Clone)]
pub struct AzureBlobClient {
    /// Blob this client talks to,
    ///
    locator: BlobLocator,
    /// Sdk client for the blob,
    ///
    client: Arc<BlobClient>,
    /// Budget for probes and range opens, zero disables the timeout,
    ///
    open_timeout: Duration,
    /// Size of each staged block,
    ///
    block_size: usize,
}

impl AzureBlobClient {
    /// Returns a new client for `locator`,
    ///
    pub fn new(locator: BlobLocator, credential: Arc<dyn TokenCredential>, options: &Options) -> Self {
        let location = CloudLocation::Custom {
            account: locator.account().to_string(),
            uri: locator.endpoint().to_string(),
        };

        let retry = if options.max_retries == 0 {
            RetryOptions::none()
        } else {
            RetryOptions::exponential(
                ExponentialRetryOptions::default().max_retries(options.max_retries),
            )
        };

        let client = ClientBuilder::with_location(location, StorageCredentials::token_credential(credential))
            .retry(retry)
            .blob_client(locator.container(), locator.blob());

        Self {
            locator,
            client: Arc::new(client),
            open_timeout: options.open_timeout,
            block_size: options.block_size.max(1),
        }
    }

    /// Returns the blob this client talks to,
    ///
    pub fn locator(&self) -> &BlobLocator {
        &self.locator
    }

    /// Returns the sdk client,
    ///
    pub fn blob_client(&self) -> &BlobClient {
        &self.client
    }

    /// Applies the open timeout to `op`,
    ///
    async fn within_open_timeout<T>(&self, op: impl Future<Output = io::Result<T>>) -> io::Result<T> {
        if self.open_timeout.is_zero() {
            return op.await;
        }

        match tokio::time::timeout(self.open_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} did not respond within {:?}", self.locator, self.open_timeout),
            )),
        }
    }
}

/// Maps an sdk error to an io error, keeping the status that matters to callers,
///
fn into_io(err: azure_core::Error) -> io::Error {
    let kind = match err.kind() {
        ErrorKind::HttpResponse { status, .. } => match status {
            StatusCode::NotFound => io::ErrorKind::NotFound,
            StatusCode::Unauthorized | StatusCode::Forbidden => io::ErrorKind::PermissionDenied,
            StatusCode::RequestedRangeNotSatisfiable => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        },
        ErrorKind::Credential => io::ErrorKind::PermissionDenied,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
}

/// Returns an error unless the first chunk of a download starts at `offset`,
///
/// A response w/o a content range holds the whole blob, which is only usable from offset 0,
///
fn check_range_start(offset: u64, content_range: Option<&Range>) -> io::Result<()> {
    let start = match content_range {
        Some(Range::Range(range)) => range.start,
        Some(Range::RangeFrom(range)) => range.start,
        None => 0,
    };

    if start == offset {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("requested range at {offset}, response starts at {start}"),
        ))
    }
}

/// Returns the id of the block at `index`, every id has the same length,
///
fn block_id(index: usize) -> BlockId {
    BlockId::new(format!("block-{index:010}"))
}

#[async_trait]
impl RangeClient for AzureBlobClient {
    type Stream = AzureRangeStream;

    fn describe(&self) -> String {
        self.locator.to_string()
    }

    async fn probe_size(&self) -> io::Result<Option<u64>> {
        let properties = self
            .within_open_timeout(async { self.client.get_properties().await.map_err(into_io) })
            .await?;

        Ok(Some(properties.blob.properties.content_length))
    }

    async fn open_range(&self, offset: u64, count: u64) -> io::Result<Self::Stream> {
        if count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("range at {offset} is empty"),
            ));
        }

        let mut pages = self.client.get().range(offset..offset + count).into_stream();

        // The first chunk is fetched here so open failures surface from the open
        let first = self
            .within_open_timeout(async { pages.next().await.transpose().map_err(into_io) })
            .await?
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "download returned no body")
            })?;
        check_range_start(offset, first.content_range.as_ref())?;

        event!(Level::DEBUG, "Opened range {offset}+{count} of {}", self.locator);
        let rest = pages
            .map_err(into_io)
            .map_ok(|page| page.data.map_err(into_io))
            .try_flatten();
        let body: BodyStream = Box::pin(first.data.map_err(into_io).chain(rest));
        Ok(StreamReader::new(body))
    }
}

#[async_trait]
impl UploadClient for AzureBlobClient {
    async fn upload(&self, mut source: UploadSource) -> io::Result<u64> {
        let mut block_ids = vec![];
        let mut uploaded = 0;

        loop {
            let mut block = Vec::with_capacity(self.block_size);
            (&mut source)
                .take(self.block_size as u64)
                .read_to_end(&mut block)
                .await?;
            if block.is_empty() {
                break;
            }

            let id = block_id(block_ids.len());
            uploaded += block.len() as u64;

            self.client
                .put_block(id.clone(), Bytes::from(block))
                .await
                .map_err(into_io)?;
            block_ids.push(id);
        }

        let blocks = block_ids.len();
        let block_list = BlockList {
            blocks: block_ids.into_iter().map(BlobBlockType::Latest).collect(),
        };
        self.client
            .put_block_list(block_list)
            .await
            .map_err(into_io)?;

        event!(
            Level::DEBUG,
            "Uploaded {uploaded} bytes in {blocks} blocks to {}",
            self.locator
        );
        Ok(uploaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(locator: &str) -> AzureBlobClient {
        AzureBlobClient::new(
            BlobLocator::parse(locator).expect("should parse"),
            Arc::new(StaticToken::new("secret")),
            &Options::default().with_block_size(4),
        )
    }

    #[tokio::test]
    async fn test_blob_urls() {
        let client = test_client("abs://myacct/data/2023/beowulf.txt");
        assert_eq!(
            client.blob_client().url().expect("should have url").as_str(),
            "https://myacct.blob.core.windows.net/data/2023/beowulf.txt"
        );
        assert_eq!(
            client.describe(),
            "https://myacct.blob.core.windows.net/data/2023/beowulf.txt"
        );

        let client = test_client("abs://127.0.0.1:10000/devstore/data/small");
        assert_eq!(
            client.blob_client().url().expect("should have url").as_str(),
            "http://127.0.0.1:10000/devstore/data/small"
        );
        assert_eq!(client.locator().container(), "data");
    }

    #[test]
    fn test_block_ids() {
        assert_eq!(block_id(3).as_ref(), b"block-0000000003");
        assert_eq!(block_id(3).as_ref().len(), block_id(1_000_000).as_ref().len());
    }

    #[test]
    fn test_range_start() {
        assert!(check_range_start(10, Some(&Range::new(10, 20))).is_ok());
        assert!(check_range_start(0, None).is_ok());

        // Server ignored the range header and sent the whole blob
        let err = check_range_start(10, None).expect_err("should reject");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(check_range_start(10, Some(&Range::new(0, 20))).is_err());
    }

    #[test]
    fn test_error_kinds() {
        let not_found = ErrorKind::http_response(StatusCode::NotFound, None).into_error();
        assert_eq!(into_io(not_found).kind(), io::ErrorKind::NotFound);

        let forbidden = ErrorKind::http_response(StatusCode::Forbidden, None).into_error();
        assert_eq!(into_io(forbidden).kind(), io::ErrorKind::PermissionDenied);

        let other = ErrorKind::Io.into_error();
        assert_eq!(into_io(other).kind(), io::ErrorKind::Other);
    }

    #[tokio::test]
    async fn test_static_token() {
        let token = StaticToken::new("secret")
            .get_token(&["https://storage.azure.com/.default"])
            .await
            .expect("should return a token");
        assert_eq!(token.token.secret(), "secret");
        assert!(!format!("{:?}", StaticToken::new("secret")).contains("secret"));
    }
}
