use std::io;
use std::sync::Arc;

/// Result alias used by every handle in this crate,
///
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by remote and local file handles,
///
/// Errors are `Clone` so that a failed range open can be kept as the reader's sticky error and
/// handed back on every subsequent read,
///
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The object reference is malformed or incomplete,
    ///
    #[error("invalid blob locator {locator:?}, {reason}")]
    InvalidLocator { locator: String, reason: String },
    /// The scheme requires credentials but none were configured,
    ///
    #[error("missing credentials for scheme {0:?}, add a credential to the opener")]
    MissingCredentials(String),
    /// A seek would land before the start of the object,
    ///
    #[error("seek target {target} is out of range")]
    OutOfRange { target: i128 },
    /// The remote object does not exist,
    ///
    #[error("object not found, {0}")]
    NotFound(String),
    /// The remote store failed, `op` names the operation that was in flight,
    ///
    #[error("{op} failed, {source}")]
    Backend {
        op: &'static str,
        #[source]
        source: Arc<io::Error>,
    },
    /// The handle's own bookkeeping is inconsistent, this is never a remote failure,
    ///
    #[error("internal inconsistency, {0}")]
    InternalInconsistency(String),
    /// No backend handles this scheme,
    ///
    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),
    /// Relative file paths can't be resolved by the opener,
    ///
    #[error("relative path {0:?} not supported")]
    RelativePath(String),
    /// Options could not be parsed,
    ///
    #[error("invalid options, {0}")]
    InvalidOptions(String),
    /// Local I/O failed,
    ///
    #[error("i/o error, {0}")]
    Io(#[source] Arc<io::Error>),
}

impl Error {
    /// Wraps a backend failure w/ the operation that produced it,
    ///
    pub fn backend(op: &'static str, err: io::Error) -> Self {
        Error::Backend {
            op,
            source: Arc::new(err),
        }
    }

    /// Wraps a failed size probe, a missing object is reported as `NotFound`,
    ///
    pub fn probe(object: impl std::fmt::Display, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Error::NotFound(format!("{object}, {err}"))
        } else {
            Error::backend("probe size", err)
        }
    }

    /// Returns an error for a handle that has already been closed,
    ///
    pub(crate) fn closed() -> Self {
        Error::Io(Arc::new(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "handle is closed",
        )))
    }

    /// Returns true if this error came from the remote store,
    ///
    pub fn is_backend(&self) -> bool {
        matches!(self, Error::Backend { .. } | Error::NotFound(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

#[test]
fn test_probe_not_found() {
    let err = Error::probe(
        "abs://acct/container/missing",
        io::Error::new(io::ErrorKind::NotFound, "404"),
    );
    assert!(matches!(err, Error::NotFound(_)));
    assert!(err.is_backend());

    let err = Error::probe(
        "abs://acct/container/blob",
        io::Error::new(io::ErrorKind::TimedOut, "slow"),
    );
    assert!(matches!(err, Error::Backend { op: "probe size", .. }));
    assert_eq!(err.to_string(), "probe size failed, slow");
}
