use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use las::point::{Classification, Format as PointFormat};
use las::{Builder, Color, Point, Reader, Transform, Vector, Writer};

use crate::errors::{ConvertError, FormatContext, Result};
use crate::formats::{PointSink, PointSource, SinkOptions, SourceInfo};
use crate::points::{Attribute, Bounds, PointChunk, PointRecord, Schema, CHUNK_SIZE};

/// Resolution used when the source gives no hint about its own precision.
pub const DEFAULT_PRECISION: f64 = 1e-6;

pub fn stores(attribute: &Attribute) -> bool {
    matches!(
        attribute,
        Attribute::Position
            | Attribute::Color
            | Attribute::Intensity
            | Attribute::Classification
            | Attribute::GpsTime
    )
}

/// Picks per-axis scale and offset so that every coordinate inside `bounds` fits an `i32`
/// without going finer than `precision`.
pub fn quantization(bounds: &Bounds, precision: Option<[f64; 3]>) -> Vector<Transform> {
    let axis = |i: usize| {
        let range = bounds.max[i] - bounds.min[i];
        let finest = precision
            .map_or(DEFAULT_PRECISION, |p| p[i])
            .max(f64::MIN_POSITIVE);
        let limit = range / (i32::MAX as f64 - 1.0);
        let scale = if finest >= limit {
            finest
        } else {
            let mut scale = 10f64.powf((limit.log10() - 1e-9).ceil());
            if scale < limit {
                scale *= 10.0;
            }
            scale
        };
        Transform {
            scale,
            offset: bounds.min[i],
        }
    };
    Vector {
        x: axis(0),
        y: axis(1),
        z: axis(2),
    }
}

pub struct LasSource {
    path: PathBuf,
    reader: Option<Reader>,
    info: SourceInfo,
}

impl LasSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| ConvertError::io(path, e))?;
        let reader = Reader::new(BufReader::new(file))
            .context("Could not read LAS header")
            .for_source(path)?;

        let header = reader.header();
        let format = header.point_format();
        let mut attributes = vec![Attribute::Intensity, Attribute::Classification];
        if format.has_color {
            attributes.push(Attribute::Color);
        }
        if format.has_gps_time {
            attributes.push(Attribute::GpsTime);
        }

        let las_bounds = header.bounds();
        let transforms = header.transforms();
        let info = SourceInfo {
            schema: Schema::new(attributes),
            count: Some(header.number_of_points()),
            bounds: Some(Bounds {
                min: [las_bounds.min.x, las_bounds.min.y, las_bounds.min.z],
                max: [las_bounds.max.x, las_bounds.max.y, las_bounds.max.z],
            }),
            precision: Some([
                transforms.x.scale,
                transforms.y.scale,
                transforms.z.scale,
            ]),
        };
        log::debug!(
            "opened {} with {} points, schema {}",
            path.display(),
            header.number_of_points(),
            info.schema
        );

        Ok(LasSource {
            path: path.to_path_buf(),
            reader: Some(reader),
            info,
        })
    }
}

impl PointSource for LasSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn read_chunk(&mut self) -> Result<Option<PointChunk>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let mut chunk = PointChunk::for_schema(&self.info.schema, CHUNK_SIZE);
        for point in reader.points().take(CHUNK_SIZE) {
            let point = point
                .context("Failed to decode LAS point")
                .for_source(&self.path)?;
            chunk.push(&PointRecord {
                position: [point.x, point.y, point.z],
                color: point
                    .color
                    .map(|c| [c.red, c.green, c.blue])
                    .unwrap_or_default(),
                intensity: point.intensity,
                classification: u8::from(point.classification),
                gps_time: point.gps_time.unwrap_or_default(),
                ..Default::default()
            });
        }
        Ok((!chunk.is_empty()).then_some(chunk))
    }

    fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}

pub struct LasSink {
    path: PathBuf,
    writer: Option<Writer<BufWriter<File>>>,
    schema: Schema,
}

impl LasSink {
    pub fn create(path: &Path, options: &SinkOptions, compressed: bool) -> Result<Self> {
        let bounds = options
            .bounds
            .ok_or_else(|| anyhow!("LAS output needs the bounding box of the source"))
            .for_destination(path)?;

        let mut builder = Builder::from((1, 4));
        // 6 and 7 are the 1.4 formats with full 8 bit classifications and gps time.
        let format_id = if options.schema.contains(&Attribute::Color) {
            7
        } else {
            6
        };
        builder.point_format = PointFormat::new(format_id)
            .context("Unsupported LAS point format")
            .for_destination(path)?;
        builder.point_format.is_compressed = compressed;
        builder.transforms = quantization(&bounds, options.precision);
        log::debug!(
            "LAS quantization for {}: scale ({}, {}, {}), offset ({}, {}, {})",
            path.display(),
            builder.transforms.x.scale,
            builder.transforms.y.scale,
            builder.transforms.z.scale,
            builder.transforms.x.offset,
            builder.transforms.y.offset,
            builder.transforms.z.offset
        );
        let header = builder
            .into_header()
            .context("Could not build LAS header")
            .for_destination(path)?;

        let file = File::create(path).map_err(|e| ConvertError::io(path, e))?;
        let writer = Writer::new(BufWriter::new(file), header)
            .context("Could not start LAS writer")
            .for_destination(path)?;

        Ok(LasSink {
            path: path.to_path_buf(),
            writer: Some(writer),
            schema: options.schema.clone(),
        })
    }
}

impl PointSink for LasSink {
    fn write_chunk(&mut self, chunk: &PointChunk) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("LAS writer is already closed"))
            .for_destination(&self.path)?;
        let has_color = self.schema.contains(&Attribute::Color);

        for (i, position) in chunk.positions.iter().enumerate() {
            let code = chunk.classifications.as_ref().map_or(0, |c| c[i]);
            let classification = Classification::new(code)
                .with_context(|| format!("Invalid LAS classification {}", code))
                .for_destination(&self.path)?;
            let point = Point {
                x: position[0],
                y: position[1],
                z: position[2],
                intensity: chunk.intensities.as_ref().map_or(0, |c| c[i]),
                classification,
                gps_time: Some(chunk.gps_times.as_ref().map_or(0.0, |c| c[i])),
                color: has_color.then(|| {
                    let [red, green, blue] = chunk.colors.as_ref().map_or([0; 3], |c| c[i]);
                    Color { red, green, blue }
                }),
                ..Default::default()
            };
            writer
                .write_point(point)
                .context("Failed to write LAS point")
                .for_destination(&self.path)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .close()
                .context("Failed to finalize LAS header")
                .for_destination(&self.path)?;
        }
        Ok(())
    }
}
