use std::fmt::Display;
use std::net::IpAddr;
use std::str::FromStr;

use url::{Host, Url};

use crate::{Error, Result};

/// Host suffix of the public blob service,
///
pub const BLOB_HOST_SUFFIX: &str = "blob.core.windows.net";

/// Struct for a fully qualified blob reference,
///
/// Accepted forms,
/// - `abs://account.blob.core.windows.net/container/path/to/blob`
/// - `abs://account/container/path/to/blob`
/// - `abs://127.0.0.1:10000/account/container/path/to/blob` (path-style, ex. an emulator)
///
/// `https` is accepted in place of `abs`,
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobLocator {
    /// Storage account name,
    ///
    account: String,
    /// Container name,
    ///
    container: String,
    /// Blob path within the container,
    ///
    blob: String,
    /// Url of the blob service endpoint, ex. `https://account.blob.core.windows.net`,
    ///
    endpoint: String,
    /// Url requests for this blob are sent to,
    ///
    blob_url: Url,
}

impl BlobLocator {
    /// Parses a blob reference,
    ///
    pub fn parse(locator: impl AsRef<str>) -> Result<Self> {
        let locator = locator.as_ref();
        let invalid = |reason: &str| Error::InvalidLocator {
            locator: locator.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(locator).map_err(|err| invalid(&err.to_string()))?;
        match url.scheme() {
            "abs" | "https" => {}
            _ => return Err(invalid("expected an abs:// or https:// scheme")),
        }

        let host = url.host().ok_or_else(|| invalid("missing account"))?;
        let mut segments = url
            .path_segments()
            .map(|s| s.filter(|s| !s.is_empty()).collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter();

        let path_style = match &host {
            Host::Domain(domain) => *domain == "localhost" || domain.parse::<IpAddr>().is_ok(),
            Host::Ipv4(_) | Host::Ipv6(_) => true,
        };

        let (account, endpoint) = if path_style {
            let account = segments.next().ok_or_else(|| invalid("missing account"))?;
            let endpoint = match url.port() {
                Some(port) => format!("http://{host}:{port}/{account}"),
                None => format!("http://{host}/{account}"),
            };
            (account.to_string(), endpoint)
        } else {
            let domain = host.to_string();
            let account = domain.split('.').next().unwrap_or_default().to_string();
            if account.is_empty() {
                return Err(invalid("missing account"));
            }

            let domain = if domain.contains('.') {
                domain
            } else {
                format!("{account}.{BLOB_HOST_SUFFIX}")
            };
            let endpoint = match url.port() {
                Some(port) => format!("https://{domain}:{port}"),
                None => format!("https://{domain}"),
            };
            (account, endpoint)
        };

        let container = segments
            .next()
            .ok_or_else(|| invalid("missing container"))?
            .to_string();
        let blob = segments.collect::<Vec<_>>().join("/");
        if blob.is_empty() {
            return Err(invalid("missing blob path"));
        }

        let blob_url = Url::parse(&format!("{endpoint}/{container}/{blob}"))
            .map_err(|err| invalid(&err.to_string()))?;

        Ok(Self {
            account,
            container,
            blob,
            endpoint,
            blob_url,
        })
    }

    /// Returns the storage account name,
    ///
    #[inline]
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Returns the container name,
    ///
    #[inline]
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Returns the blob path within the container,
    ///
    #[inline]
    pub fn blob(&self) -> &str {
        &self.blob
    }

    /// Returns the blob service endpoint w/o a trailing slash,
    ///
    #[inline]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns the url requests are sent to,
    ///
    #[inline]
    pub fn blob_url(&self) -> &Url {
        &self.blob_url
    }
}

impl FromStr for BlobLocator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        BlobLocator::parse(s)
    }
}

impl Display for BlobLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.blob_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_service_host() {
        let locator =
            BlobLocator::parse("abs://myacct.blob.core.windows.net/data/2023/beowulf.txt")
                .expect("should parse");

        assert_eq!(locator.account(), "myacct");
        assert_eq!(locator.container(), "data");
        assert_eq!(locator.blob(), "2023/beowulf.txt");
        assert_eq!(
            locator.blob_url().as_str(),
            "https://myacct.blob.core.windows.net/data/2023/beowulf.txt"
        );
    }

    #[test]
    fn test_parse_account_shorthand() {
        let locator: BlobLocator = "abs://myacct/data/beowulf.txt".parse().expect("should parse");

        assert_eq!(locator.account(), "myacct");
        assert_eq!(locator.endpoint(), "https://myacct.blob.core.windows.net");
        assert_eq!(
            locator.to_string(),
            "https://myacct.blob.core.windows.net/data/beowulf.txt"
        );
    }

    #[test]
    fn test_parse_path_style() {
        let locator = BlobLocator::parse("abs://127.0.0.1:10000/devstore/data/small")
            .expect("should parse");

        assert_eq!(locator.account(), "devstore");
        assert_eq!(locator.container(), "data");
        assert_eq!(locator.blob(), "small");
        assert_eq!(locator.endpoint(), "http://127.0.0.1:10000/devstore");
        assert_eq!(
            locator.blob_url().as_str(),
            "http://127.0.0.1:10000/devstore/data/small"
        );
    }

    #[test]
    fn test_parse_incomplete() {
        for bad in [
            "abs://myacct.blob.core.windows.net/data",
            "abs://myacct.blob.core.windows.net/",
            "abs://127.0.0.1:10000/devstore/data",
            "file:///tmp/data/blob",
            "not a url",
        ] {
            let err = BlobLocator::parse(bad).expect_err("should fail");
            assert!(matches!(err, Error::InvalidLocator { .. }), "{bad}: {err}");
        }
    }
}
