//! Error handling and errno mapping for Pod operations.
//!
//! Every operation on [`PodFs`](crate::fs::PodFs) returns a [`PodError`]
//! on failure. The FUSE bridge converts these to POSIX error codes via
//! [`PodError::to_errno`]; the correlation between HTTP status codes and
//! errno values is strong enough that most remote failures map directly.

use std::io;
use thiserror::Error;

/// Errors produced by the Pod translation engine.
#[derive(Debug, Error)]
pub enum PodError {
    /// The path (or its parent) does not exist, locally or remotely.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// A directory operation was attempted on a non-RDF resource.
    #[error("not a container: {0}")]
    NotAContainer(String),

    /// A file operation was attempted on a container.
    #[error("is a container: {0}")]
    IsAContainer(String),

    /// rmdir on a container that still has members.
    #[error("container not empty: {0}")]
    NotEmpty(String),

    /// create/mkdir on a path that already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The remote store rejected the request even after re-authentication,
    /// or a read-only attribute was written.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The operation has no sensible Pod translation (recursive container
    /// rename, unknown extended attribute, ...).
    #[error("not supported: {0}")]
    NotSupported(String),

    /// getxattr on a supported attribute with no recorded value.
    #[error("no value for attribute {0}")]
    NoAttr(String),

    /// The path failed local validation before any network call.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Token minting failed at the token endpoint.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The remote store answered with an unexpected status code.
    #[error("unexpected HTTP status {status} for {url}")]
    Http { status: u16, url: String },

    /// The request never produced a usable response (connect failure,
    /// timeout, malformed body).
    #[error("transport failure: {0}")]
    Transport(String),

    /// IO error from the local side of the bridge.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl PodError {
    /// Converts this error to a libc error code for the FUSE reply.
    pub fn to_errno(&self) -> i32 {
        match self {
            PodError::NotFound(_) => libc::ENOENT,
            PodError::NotAContainer(_) => libc::ENOTDIR,
            PodError::IsAContainer(_) => libc::EISDIR,
            PodError::NotEmpty(_) => libc::ENOTEMPTY,
            PodError::AlreadyExists(_) => libc::EEXIST,
            PodError::PermissionDenied(_) | PodError::Auth(_) => libc::EACCES,
            PodError::NotSupported(_) => libc::ENOTSUP,
            PodError::NoAttr(_) => libc::ENODATA,
            PodError::InvalidPath(msg) if msg.contains("too long") => libc::ENAMETOOLONG,
            PodError::InvalidPath(_) => libc::EINVAL,
            PodError::Http { status, .. } => http_status_to_errno(*status),
            PodError::Transport(_) => libc::EIO,
            PodError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Builds the error for an unexpected response, folding well-known
    /// statuses into their dedicated variants.
    pub fn from_status(status: u16, url: &str) -> Self {
        match status {
            404 | 410 => PodError::NotFound(url.to_string()),
            401 | 403 => PodError::PermissionDenied(url.to_string()),
            409 => PodError::AlreadyExists(url.to_string()),
            _ => PodError::Http {
                status,
                url: url.to_string(),
            },
        }
    }
}

/// Maps an HTTP status code to an errno value.
///
/// Statuses that do not carry a precise POSIX meaning fall back to coarse
/// buckets: redirects indicate the resource moved underneath us, server
/// errors are worth retrying by the caller, anything unrecognized is a
/// malformed exchange.
pub fn http_status_to_errno(status: u16) -> i32 {
    match status {
        100..=299 => 0,
        300..=399 => libc::EREMCHG,
        401 | 403 => libc::EACCES,
        404 | 410 => libc::ENOENT,
        405 | 406 => libc::ENOTSUP,
        409 => libc::EEXIST,
        412 => libc::EBUSY,
        400..=499 => libc::EINVAL,
        500..=599 => libc::EAGAIN,
        _ => libc::EBADMSG,
    }
}

/// Maximum accepted path length, matching common PATH_MAX expectations.
pub const MAX_PATH_LEN: usize = 1024;

/// Validates a filesystem path before it is used as a hierarchy key.
///
/// This guards against what the kernel should never send but fuzzers and
/// broken clients will: relative paths, embedded NULs, oversized names.
/// It does not guarantee the remote store will accept the path.
pub fn validate_path(path: &str) -> Result<(), PodError> {
    if !path.starts_with('/') {
        return Err(PodError::InvalidPath(format!("not absolute: {path}")));
    }
    if path.len() >= MAX_PATH_LEN {
        return Err(PodError::InvalidPath(format!(
            "too long ({} bytes): {}...",
            path.len(),
            &path[..32]
        )));
    }
    if path.contains('\0') {
        return Err(PodError::InvalidPath("embedded NUL".to_string()));
    }
    Ok(())
}

/// Result type for Pod operations.
pub type PodResult<T> = Result<T, PodError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(PodError::NotFound("/a".into()).to_errno(), libc::ENOENT);
        assert_eq!(
            PodError::NotAContainer("/a".into()).to_errno(),
            libc::ENOTDIR
        );
        assert_eq!(PodError::IsAContainer("/a".into()).to_errno(), libc::EISDIR);
        assert_eq!(PodError::NotEmpty("/a".into()).to_errno(), libc::ENOTEMPTY);
        assert_eq!(
            PodError::AlreadyExists("/a".into()).to_errno(),
            libc::EEXIST
        );
        assert_eq!(
            PodError::PermissionDenied("/a".into()).to_errno(),
            libc::EACCES
        );
        assert_eq!(
            PodError::NotSupported("user.other".into()).to_errno(),
            libc::ENOTSUP
        );
        assert_eq!(
            PodError::Transport("connection refused".into()).to_errno(),
            libc::EIO
        );
    }

    #[test]
    fn test_http_status_buckets() {
        assert_eq!(http_status_to_errno(200), 0);
        assert_eq!(http_status_to_errno(204), 0);
        assert_eq!(http_status_to_errno(301), libc::EREMCHG);
        assert_eq!(http_status_to_errno(401), libc::EACCES);
        assert_eq!(http_status_to_errno(403), libc::EACCES);
        assert_eq!(http_status_to_errno(404), libc::ENOENT);
        assert_eq!(http_status_to_errno(406), libc::ENOTSUP);
        assert_eq!(http_status_to_errno(418), libc::EINVAL);
        assert_eq!(http_status_to_errno(503), libc::EAGAIN);
        assert_eq!(http_status_to_errno(700), libc::EBADMSG);
    }

    #[test]
    fn test_from_status_folds_known_codes() {
        assert!(matches!(
            PodError::from_status(404, "http://x/a"),
            PodError::NotFound(_)
        ));
        assert!(matches!(
            PodError::from_status(403, "http://x/a"),
            PodError::PermissionDenied(_)
        ));
        assert!(matches!(
            PodError::from_status(500, "http://x/a"),
            PodError::Http { status: 500, .. }
        ));
    }

    #[test]
    fn test_path_validation() {
        assert!(validate_path("/ok/path.txt").is_ok());
        assert!(validate_path("relative").is_err());
        assert!(validate_path("/nul\0byte").is_err());

        let long = format!("/{}", "a".repeat(MAX_PATH_LEN));
        let err = validate_path(&long).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENAMETOOLONG);
    }
}
