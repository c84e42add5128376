use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::anyhow;

use crate::commands::pointcloud::destination::{self, Target};
use crate::commands::pointcloud::pipeline::{self, Job};
use crate::commands::pointcloud::potree;
use crate::commands::pointcloud::safety::{self, Entry};
use crate::errors::{ConvertError, Result};
use crate::formats::{self, Format};
use crate::shared::config::Settings;
use crate::shared::progress::{elapsed_suffix, Reporter};
use crate::ConvertArgs;

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Hidden sibling used while converting a file onto itself.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(path.file_name().unwrap_or_default());
    name.push(".partial");
    path.with_file_name(name)
}

pub fn execute(args: ConvertArgs, settings: Settings, reporter: &mut Reporter) -> Result<()> {
    let started = Instant::now();
    formats::ensure_source_exists(&args.origin)?;
    let origin_format = Format::from_path(&args.origin).ok_or_else(|| {
        let extension = args
            .origin
            .extension()
            .map(|e| format!("'.{}'", e.to_string_lossy()))
            .unwrap_or_else(|| "no extension".to_string());
        ConvertError::source_format(
            &args.origin,
            anyhow!("unsupported point cloud extension: {}", extension),
        )
    })?;
    reporter.success(&format!(
        "Found {} point cloud at {}",
        origin_format,
        args.origin.display()
    ));

    let resolved = destination::resolve(
        &args.origin,
        args.destination.as_deref(),
        args.extension.as_deref(),
    )?;
    if let Some(extension) = &resolved.ignored_extension {
        reporter.warning(&format!(
            "Extension {} is ignored since the destination {} already names a file",
            extension,
            resolved.path.display()
        ));
    }
    if args.destination.is_none() && args.extension.is_none() {
        reporter.warning(&format!(
            "No destination or extension given, writing {}",
            resolved.path.display()
        ));
    }

    let text_encoding = args.ascii || settings.text_encoding;
    let converter = args
        .potree_converter
        .as_deref()
        .or(settings.potree_converter.as_deref());

    match resolved.target {
        Target::Potree => {
            safety::check(&resolved.path, Entry::Directory, args.unlocked)?;
            safety::prepare_parent(&resolved.path)?;
            potree::export(
                &args.origin,
                origin_format,
                &resolved.path,
                converter,
                reporter,
            )?;
            reporter.success(&format!(
                "Written point cloud at {} {}",
                resolved.path.display(),
                elapsed_suffix(started)
            ));
        }
        Target::File(format) => {
            safety::check(&resolved.path, Entry::File, args.unlocked)?;
            safety::prepare_parent(&resolved.path)?;
            let staging =
                same_file(&args.origin, &resolved.path).then(|| staging_path(&resolved.path));
            let job = Job {
                origin: &args.origin,
                source_format: &origin_format,
                destination: staging.as_deref().unwrap_or(&resolved.path),
                destination_format: &format,
                text_encoding,
            };
            let summary = pipeline::convert(&job, reporter)?;
            if let Some(staging) = &staging {
                fs::rename(staging, &resolved.path).map_err(|e| {
                    let _ = fs::remove_file(staging);
                    ConvertError::io(&resolved.path, e)
                })?;
            }
            reporter.success(&format!(
                "Written {} points to {} {}",
                summary.points,
                resolved.path.display(),
                elapsed_suffix(started)
            ));
        }
    }
    Ok(())
}
