//! Turns the origin path and the optional destination and extension arguments into the final
//! output path. Pure: nothing here touches the filesystem.

use std::path::{Path, PathBuf};

use itertools::Itertools;

use crate::errors::{ConvertError, Result};
use crate::formats::Format;

pub const DEFAULT_FORMAT: Format = Format::Las;
const POTREE: &str = "potree";

/// What gets written at the resolved path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    File(Format),
    /// A directory produced by PotreeConverter.
    Potree,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub path: PathBuf,
    pub target: Target,
    /// Extension argument that was ignored because the destination already named a file.
    pub ignored_extension: Option<String>,
}

fn valid_extensions() -> String {
    Format::ALL
        .iter()
        .map(|f| f.extension())
        .chain(std::iter::once(POTREE))
        .join(", ")
}

/// Parses an extension argument such as `.PLY`, `ply` or `potree`.
pub fn parse_extension(extension: &str) -> Result<Target> {
    if extension.trim_start_matches('.').eq_ignore_ascii_case(POTREE) {
        return Ok(Target::Potree);
    }
    Format::from_extension(extension)
        .map(Target::File)
        .ok_or_else(|| {
            ConvertError::Resolution(format!(
                "'{}' is not a supported extension, expected one of: {}",
                extension,
                valid_extensions()
            ))
        })
}

pub fn resolve(
    origin: &Path,
    destination: Option<&Path>,
    extension: Option<&str>,
) -> Result<Resolved> {
    let stem = origin
        .file_stem()
        .ok_or_else(|| {
            ConvertError::Resolution(format!("'{}' does not name a file", origin.display()))
        })?
        .to_string_lossy()
        .into_owned();
    let requested = extension.map(parse_extension).transpose()?;

    if let Some(destination) = destination {
        if let Some(format) = Format::from_path(destination) {
            return Ok(Resolved {
                path: destination.to_path_buf(),
                target: Target::File(format),
                ignored_extension: extension.map(str::to_string),
            });
        }
    }

    let directory = match destination {
        Some(directory) => directory.to_path_buf(),
        None => origin.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    let target = requested.unwrap_or(Target::File(DEFAULT_FORMAT));
    let file_name = match target {
        Target::File(format) => format!("{}{}", stem, format.extension()),
        Target::Potree => format!("{}_{}", stem, POTREE),
    };
    Ok(Resolved {
        path: directory.join(file_name),
        target,
        ignored_extension: None,
    })
}
