use std::io;
use thiserror::Error;

/// Failures reported by a [`NativeProvider`](crate::native::NativeProvider).
///
/// These stay on the provider side of the boundary. The entity layer logs
/// them and turns them into the empty / `false` / zero-byte results that its
/// callers branch on.
#[derive(Debug, Error)]
pub enum NativeError {
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    /// A failed platform scan. Displays as the outermost context of the
    /// chain; the rest is reachable through `source()`.
    #[error(transparent)]
    Enumeration(#[from] anyhow::Error),

    #[error("failed to mount {device} at {target}: {status}")]
    Mount {
        device: String,
        target: String,
        status: String,
    },

    #[error("failed to unmount {path}: {source}")]
    Unmount {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, NativeError>;
