//! Format adapters. Every on-disk format implements the same capability set, so the
//! conversion pipeline never branches on the concrete format.

use std::fmt;
use std::path::Path;

use crate::errors::{ConvertError, Result};
use crate::points::{Attribute, Bounds, PointChunk, Schema};

pub mod e57;
pub mod las;
pub mod pcd;
pub mod ply;
pub mod pts;

/// What an opened source knows about its stream before the first chunk is read.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub schema: Schema,
    /// Exact number of points if the format stores it.
    pub count: Option<u64>,
    pub bounds: Option<Bounds>,
    /// Coordinate resolution per axis if the format is quantized.
    pub precision: Option<[f64; 3]>,
}

impl SourceInfo {
    pub fn new(schema: Schema) -> Self {
        SourceInfo {
            schema,
            count: None,
            bounds: None,
            precision: None,
        }
    }
}

/// Forward-only stream of chunks. Restarting means opening the file again.
pub trait PointSource {
    fn info(&self) -> &SourceInfo;

    /// Next chunk, or `None` once the stream is exhausted.
    fn read_chunk(&mut self) -> Result<Option<PointChunk>>;

    /// How far through its input the source is, as `(done, total)` in units of its choosing.
    /// Only consulted when the point count is unknown.
    fn progress(&self) -> Option<(u64, u64)> {
        None
    }

    fn close(&mut self) -> Result<()>;
}

/// Appends chunks to a destination file in the order they are received.
pub trait PointSink {
    fn write_chunk(&mut self, chunk: &PointChunk) -> Result<()>;

    /// Writes trailers and patches headers. Calling it again is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// Facts a sink needs before the first point is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkRequirements {
    pub bounds: bool,
    pub count: bool,
}

/// Everything handed to a sink when it is opened.
#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub schema: Schema,
    pub count: Option<u64>,
    pub bounds: Option<Bounds>,
    pub precision: Option<[f64; 3]>,
    /// Prefer the text variant for formats that have one.
    pub text_encoding: bool,
}

impl SinkOptions {
    pub fn new(schema: Schema) -> Self {
        SinkOptions {
            schema,
            count: None,
            bounds: None,
            precision: None,
            text_encoding: false,
        }
    }
}

/// The capability set shared by all formats.
pub trait PointFormat {
    fn name(&self) -> &str;

    /// Whether the format can store `attribute`. Position is always storable.
    fn stores(&self, attribute: &Attribute) -> bool;

    fn requirements(&self) -> SinkRequirements {
        SinkRequirements::default()
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn PointSource>>;

    fn open_write(&self, path: &Path, options: &SinkOptions) -> Result<Box<dyn PointSink>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Las,
    Laz,
    Ply,
    E57,
    Pts,
    Pcd,
}

impl Format {
    pub const ALL: [Format; 6] = [
        Format::Las,
        Format::Laz,
        Format::Ply,
        Format::E57,
        Format::Pts,
        Format::Pcd,
    ];

    /// Parses an extension such as `.laz`, `LAZ` or `laz`.
    pub fn from_extension(extension: &str) -> Option<Format> {
        let extension = extension.trim_start_matches('.').to_lowercase();
        Format::ALL
            .into_iter()
            .find(|f| f.extension()[1..] == extension)
    }

    pub fn from_path(path: &Path) -> Option<Format> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Format::from_extension)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Format::Las => ".las",
            Format::Laz => ".laz",
            Format::Ply => ".ply",
            Format::E57 => ".e57",
            Format::Pts => ".pts",
            Format::Pcd => ".pcd",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.extension()[1..].to_uppercase())
    }
}

/// Fails with `NotFound` unless `path` is an existing file.
pub fn ensure_source_exists(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ConvertError::NotFound(path.to_path_buf()))
    }
}

/// Rejects schemas no format can represent.
pub fn ensure_representable(path: &Path, schema: &Schema) -> Result<()> {
    if schema.has_position() {
        Ok(())
    } else {
        Err(ConvertError::destination_format(
            path,
            anyhow::anyhow!("the stream schema {} has no position attribute", schema),
        ))
    }
}

impl PointFormat for Format {
    fn name(&self) -> &str {
        &self.extension()[1..]
    }

    fn stores(&self, attribute: &Attribute) -> bool {
        match self {
            Format::Las | Format::Laz => las::stores(attribute),
            Format::Ply => ply::stores(attribute),
            Format::E57 => e57::stores(attribute),
            Format::Pts => pts::stores(attribute),
            Format::Pcd => pcd::stores(attribute),
        }
    }

    fn requirements(&self) -> SinkRequirements {
        match self {
            Format::Las | Format::Laz => SinkRequirements {
                bounds: true,
                count: false,
            },
            Format::Pts | Format::Pcd => SinkRequirements {
                bounds: false,
                count: true,
            },
            Format::Ply | Format::E57 => SinkRequirements::default(),
        }
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn PointSource>> {
        ensure_source_exists(path)?;
        Ok(match self {
            Format::Las | Format::Laz => Box::new(las::LasSource::open(path)?),
            Format::Ply => Box::new(ply::PlySource::open(path)?),
            Format::E57 => Box::new(e57::E57Source::open(path)?),
            Format::Pts => Box::new(pts::PtsSource::open(path)?),
            Format::Pcd => Box::new(pcd::PcdSource::open(path)?),
        })
    }

    fn open_write(&self, path: &Path, options: &SinkOptions) -> Result<Box<dyn PointSink>> {
        ensure_representable(path, &options.schema)?;
        Ok(match self {
            Format::Las => Box::new(las::LasSink::create(path, options, false)?),
            Format::Laz => Box::new(las::LasSink::create(path, options, true)?),
            Format::Ply => Box::new(ply::PlySink::create(path, options)?),
            Format::E57 => Box::new(e57::E57Sink::create(path, options)?),
            Format::Pts => Box::new(pts::PtsSink::create(path, options)?),
            Format::Pcd => Box::new(pcd::PcdSink::create(path, options)?),
        })
    }
}
