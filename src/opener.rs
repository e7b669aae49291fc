use std::path::PathBuf;
use std::sync::Arc;

use tracing::{event, Level};
use url::Url;

use crate::{
    AzureBlobClient, BlobLocator, BlobReader, BlobWriter, Error, LocalFile, Options, RandomAccess,
    ReadAccounting, Result, SequentialWrite, TokenCredential,
};

/// Scheme for local files,
///
pub const FILE_SCHEME: &str = "file";

/// Scheme for Azure blobs,
///
pub const BLOB_SCHEME: &str = "abs";

/// Type-alias for a boxed reader returned by the opener,
///
pub type BoxReader = Box<dyn RandomAccess>;

/// Type-alias for a boxed writer returned by the opener,
///
pub type BoxWriter = Box<dyn SequentialWrite>;

/// Struct that picks a backend from a locator's scheme,
///
/// Supported schemes,
/// - `file:///absolute/path` opens a local file
/// - `abs://account/container/blob` opens a blob, requires a credential
///
#[derive(Clone, Default)]
pub struct Opener {
    credential: Option<Arc<dyn TokenCredential>>,
    options: Options,
}

/// Scheme and parsed target of a locator,
///
enum Target {
    File(PathBuf),
    Blob(BlobLocator),
}

impl Opener {
    /// Returns a new opener w/ default options and no credentials,
    ///
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the credential used for `abs` locators,
    ///
    pub fn with_azure_credential(mut self, credential: impl TokenCredential + 'static) -> Self {
        self.credential = Some(Arc::new(credential));
        self
    }

    /// Sets the credential used for `abs` locators from the environment,
    ///
    /// Uses the azure identity default chain, ex. environment variables, managed identity, or the
    /// azure cli,
    ///
    pub fn with_default_azure_credential(mut self) -> Result<Self> {
        let credential = azure_identity::create_default_credential().map_err(|err| {
            Error::MissingCredentials(format!("{BLOB_SCHEME}, {err}"))
        })?;
        self.credential = Some(credential);
        Ok(self)
    }

    /// Sets the options handed to every handle,
    ///
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Returns the current options,
    ///
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Opens `locator` for random access reads,
    ///
    pub async fn open_reader(&self, locator: &str) -> Result<BoxReader> {
        match self.resolve(locator)? {
            Target::File(path) => Ok(Box::new(LocalFile::open(path).await?)),
            Target::Blob(blob) => {
                let client = self.blob_client(blob)?;
                let reader = BlobReader::open(client).await?;

                if self.options.accounting {
                    event!(Level::DEBUG, "Read accounting enabled for {locator}");
                    let accounting = ReadAccounting::new(self.options.report_interval);
                    Ok(Box::new(reader.with_observer(Arc::new(accounting))))
                } else {
                    Ok(Box::new(reader))
                }
            }
        }
    }

    /// Opens `locator` for a sequential write that replaces its contents,
    ///
    /// Must be called within a tokio runtime,
    ///
    pub async fn open_writer(&self, locator: &str) -> Result<BoxWriter> {
        match self.resolve(locator)? {
            Target::File(path) => Ok(Box::new(LocalFile::create(path).await?)),
            Target::Blob(blob) => {
                let client = self.blob_client(blob)?;
                Ok(Box::new(BlobWriter::start(client, &self.options)))
            }
        }
    }

    /// Returns a blob client for `locator`,
    ///
    fn blob_client(&self, locator: BlobLocator) -> Result<AzureBlobClient> {
        let credential = self
            .credential
            .clone()
            .ok_or_else(|| Error::MissingCredentials(BLOB_SCHEME.to_string()))?;

        Ok(AzureBlobClient::new(locator, credential, &self.options))
    }

    /// Parses `locator` and checks that it can be opened,
    ///
    fn resolve(&self, locator: &str) -> Result<Target> {
        let (scheme, rest) = locator.split_once("://").ok_or_else(|| Error::InvalidLocator {
            locator: locator.to_string(),
            reason: "expected scheme://".to_string(),
        })?;

        if rest.starts_with('.') {
            return Err(Error::RelativePath(locator.to_string()));
        }

        match scheme {
            FILE_SCHEME => {
                let url = Url::parse(locator).map_err(|err| Error::InvalidLocator {
                    locator: locator.to_string(),
                    reason: err.to_string(),
                })?;

                url.to_file_path()
                    .map(Target::File)
                    .map_err(|_| Error::RelativePath(locator.to_string()))
            }
            BLOB_SCHEME => {
                if self.credential.is_none() {
                    return Err(Error::MissingCredentials(BLOB_SCHEME.to_string()));
                }
                BlobLocator::parse(locator).map(Target::Blob)
            }
            _ => Err(Error::UnsupportedScheme(scheme.to_string())),
        }
    }
}
