use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Which end of a conversion an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => write!(f, "source"),
            Side::Destination => write!(f, "destination"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("no point cloud file found at '{}'", .0.display())]
    NotFound(PathBuf),

    #[error("{side} '{}' could not be handled as a point cloud", .path.display())]
    Format {
        side: Side,
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("refusing to overwrite '{}' (pass --unsafe to allow it)", .0.display())]
    OverwriteDenied(PathBuf),

    #[error("{0}")]
    Resolution(String),

    #[error("PotreeConverter failed: {message}")]
    ExternalTool {
        message: String,
        /// Last lines the converter printed before exiting.
        output: Vec<String>,
    },

    #[error("I/O failure on '{}'", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T, E = ConvertError> = std::result::Result<T, E>;

impl ConvertError {
    pub fn source_format(path: &Path, source: anyhow::Error) -> Self {
        ConvertError::Format {
            side: Side::Source,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn destination_format(path: &Path, source: anyhow::Error) -> Self {
        ConvertError::Format {
            side: Side::Destination,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn io(path: &Path, source: std::io::Error) -> Self {
        ConvertError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Process exit code for this error. These values are part of the CLI contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            ConvertError::Resolution(_) => 2,
            ConvertError::NotFound(_) => 3,
            ConvertError::OverwriteDenied(_) => 4,
            ConvertError::Format {
                side: Side::Source,
                ..
            } => 5,
            ConvertError::Format {
                side: Side::Destination,
                ..
            } => 6,
            ConvertError::ExternalTool { .. } => 7,
            ConvertError::Io { .. } => 8,
        }
    }
}

/// Attach the side and path of a codec failure while keeping its context chain.
pub trait FormatContext<T> {
    fn for_source(self, path: &Path) -> Result<T>;
    fn for_destination(self, path: &Path) -> Result<T>;
}

impl<T> FormatContext<T> for anyhow::Result<T> {
    fn for_source(self, path: &Path) -> Result<T> {
        self.map_err(|e| ConvertError::source_format(path, e))
    }

    fn for_destination(self, path: &Path) -> Result<T> {
        self.map_err(|e| ConvertError::destination_format(path, e))
    }
}
