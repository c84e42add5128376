use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use pcd_rs::{DataKind, DynReader, DynRecord, Field, FieldDef, ValueKind, Writer, WriterInit};

use crate::errors::{FormatContext, Result};
use crate::formats::{PointSink, PointSource, SinkOptions, SourceInfo};
use crate::points::{
    narrow_color, widen_color, Attribute, PointChunk, PointRecord, Schema, CHUNK_SIZE,
};

pub fn stores(_attribute: &Attribute) -> bool {
    true
}

/// Where a PCD field ends up in the point model.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Slot {
    Axis(usize),
    Rgb,
    Intensity,
    Classification,
    Normal(usize),
    GpsTime,
    Scalar(usize),
    Skip,
}

fn slot_for(name: &str) -> Option<Slot> {
    Some(match name.to_lowercase().as_str() {
        "x" => Slot::Axis(0),
        "y" => Slot::Axis(1),
        "z" => Slot::Axis(2),
        "rgb" | "rgba" => Slot::Rgb,
        "intensity" | "intensities" => Slot::Intensity,
        "label" | "classification" => Slot::Classification,
        "normal_x" => Slot::Normal(0),
        "normal_y" => Slot::Normal(1),
        "normal_z" => Slot::Normal(2),
        "gps_time" => Slot::GpsTime,
        _ => return None,
    })
}

/// Field name for a scalar. Names the reader would take for a built-in attribute get a
/// `scalar_` prefix.
fn scalar_field_name(name: &str) -> String {
    let name = name.split_whitespace().collect::<Vec<_>>().join("_");
    if slot_for(&name).is_some() {
        format!("scalar_{}", name)
    } else {
        name
    }
}

fn field_value(field: &Field) -> Option<f64> {
    Some(match field {
        Field::I8(v) => *v.first()? as f64,
        Field::I16(v) => *v.first()? as f64,
        Field::I32(v) => *v.first()? as f64,
        Field::U8(v) => *v.first()? as f64,
        Field::U16(v) => *v.first()? as f64,
        Field::U32(v) => *v.first()? as f64,
        Field::F32(v) => *v.first()? as f64,
        Field::F64(v) => *v.first()?,
    })
}

/// PCL stores color as the bits of a 0x00RRGGBB integer, usually reinterpreted as a float.
fn unpack_rgb(field: &Field) -> Option<[u16; 3]> {
    let packed = match field {
        Field::F32(v) => bytemuck::cast::<f32, u32>(*v.first()?),
        Field::U32(v) => *v.first()?,
        Field::I32(v) => bytemuck::cast::<i32, u32>(*v.first()?),
        _ => return None,
    };
    let channel = |shift: u32| widen_color(((packed >> shift) & 0xff) as u8);
    Some([channel(16), channel(8), channel(0)])
}

fn pack_rgb(color: [u16; 3]) -> f32 {
    let [r, g, b] = color.map(|c| narrow_color(c) as u32);
    bytemuck::cast::<u32, f32>((r << 16) | (g << 8) | b)
}

fn map_fields(fields: &[FieldDef]) -> anyhow::Result<(Vec<Slot>, Schema)> {
    let mut slots = Vec::with_capacity(fields.len());
    let mut attributes = Vec::new();
    let mut scalar_count = 0;
    for field in fields {
        let slot = match slot_for(&field.name) {
            Some(slot) => slot,
            None if field.count == 1 => {
                attributes.push(Attribute::Scalar(field.name.clone()));
                scalar_count += 1;
                Slot::Scalar(scalar_count - 1)
            }
            None => {
                log::warn!(
                    "skipping PCD field '{}' with {} components",
                    field.name,
                    field.count
                );
                Slot::Skip
            }
        };
        match slot {
            Slot::Rgb => attributes.push(Attribute::Color),
            Slot::Intensity => attributes.push(Attribute::Intensity),
            Slot::Classification => attributes.push(Attribute::Classification),
            Slot::Normal(_) => attributes.push(Attribute::Normal),
            Slot::GpsTime => attributes.push(Attribute::GpsTime),
            _ => {}
        }
        slots.push(slot);
    }
    for axis in 0..3 {
        if !slots.contains(&Slot::Axis(axis)) {
            return Err(anyhow!("PCD file has no '{}' field", ["x", "y", "z"][axis]));
        }
    }
    Ok((slots, Schema::new(attributes)))
}

pub struct PcdSource {
    path: PathBuf,
    reader: Option<DynReader<BufReader<File>>>,
    slots: Vec<Slot>,
    info: SourceInfo,
}

impl PcdSource {
    pub fn open(path: &Path) -> Result<Self> {
        let reader = DynReader::open(path)
            .context("Could not read PCD header")
            .for_source(path)?;
        let meta = reader.meta();
        let (slots, schema) = map_fields(&meta.field_defs.fields).for_source(path)?;
        let mut info = SourceInfo::new(schema);
        info.count = Some(meta.num_points);
        log::debug!(
            "opened {} ({:?}) with {} points, schema {}",
            path.display(),
            meta.data,
            meta.num_points,
            info.schema
        );

        Ok(PcdSource {
            path: path.to_path_buf(),
            reader: Some(reader),
            slots,
            info,
        })
    }
}

impl PointSource for PcdSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn read_chunk(&mut self) -> Result<Option<PointChunk>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let mut chunk = PointChunk::for_schema(&self.info.schema, CHUNK_SIZE);
        let mut point = PointRecord {
            scalars: vec![0.0; self.info.schema.scalar_names().count()],
            ..Default::default()
        };
        for record in reader.take(CHUNK_SIZE) {
            let record = record
                .context("Failed to decode PCD point")
                .for_source(&self.path)?;
            for (slot, field) in self.slots.iter().zip(&record.0) {
                if *slot == Slot::Rgb {
                    point.color = unpack_rgb(field)
                        .ok_or_else(|| anyhow!("PCD 'rgb' field has an unsupported type"))
                        .for_source(&self.path)?;
                    continue;
                }
                let Some(value) = field_value(field) else {
                    continue;
                };
                match *slot {
                    Slot::Axis(axis) => point.position[axis] = value,
                    Slot::Intensity => {
                        point.intensity = value.round().clamp(0.0, u16::MAX as f64) as u16
                    }
                    Slot::Classification => {
                        point.classification = value.clamp(0.0, u8::MAX as f64) as u8
                    }
                    Slot::Normal(axis) => point.normal[axis] = value as f32,
                    Slot::GpsTime => point.gps_time = value,
                    Slot::Scalar(i) => point.scalars[i] = value,
                    Slot::Rgb | Slot::Skip => {}
                }
            }
            chunk.push(&point);
        }
        Ok((!chunk.is_empty()).then_some(chunk))
    }

    fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}

pub struct PcdSink {
    path: PathBuf,
    writer: Option<Writer<DynRecord, BufWriter<File>>>,
    schema: Schema,
}

fn field_defs(schema: &Schema) -> pcd_rs::Schema {
    let mut defs: Vec<(String, ValueKind, u64)> = Vec::new();
    for attribute in schema.attributes() {
        match attribute {
            Attribute::Position => {
                for axis in ["x", "y", "z"] {
                    defs.push((axis.to_string(), ValueKind::F64, 1));
                }
            }
            Attribute::Color => defs.push(("rgb".into(), ValueKind::F32, 1)),
            Attribute::Intensity => defs.push(("intensity".into(), ValueKind::F32, 1)),
            Attribute::Classification => defs.push(("classification".into(), ValueKind::U8, 1)),
            Attribute::Normal => {
                for axis in ["normal_x", "normal_y", "normal_z"] {
                    defs.push((axis.to_string(), ValueKind::F32, 1));
                }
            }
            Attribute::GpsTime => defs.push(("gps_time".into(), ValueKind::F64, 1)),
            Attribute::Scalar(name) => defs.push((scalar_field_name(name), ValueKind::F64, 1)),
        }
    }
    pcd_rs::Schema {
        fields: defs
            .into_iter()
            .map(|(name, kind, count)| FieldDef { name, kind, count })
            .collect(),
    }
}

impl PcdSink {
    pub fn create(path: &Path, options: &SinkOptions) -> Result<Self> {
        let count = options
            .count
            .ok_or_else(|| anyhow!("PCD output needs the number of points up front"))
            .for_destination(path)?;
        let data_kind = if options.text_encoding {
            DataKind::Ascii
        } else {
            DataKind::Binary
        };
        let writer: Writer<DynRecord, BufWriter<File>> = WriterInit {
            width: count,
            height: 1,
            viewpoint: Default::default(),
            data_kind,
            schema: Some(field_defs(&options.schema)),
        }
        .create(path)
        .context("Could not start PCD writer")
        .for_destination(path)?;

        Ok(PcdSink {
            path: path.to_path_buf(),
            writer: Some(writer),
            schema: options.schema.clone(),
        })
    }

    fn record(&self, chunk: &PointChunk, i: usize) -> DynRecord {
        let mut fields = Vec::new();
        for attribute in self.schema.attributes() {
            match attribute {
                Attribute::Position => {
                    fields.extend(chunk.positions[i].iter().map(|v| Field::F64(vec![*v])))
                }
                Attribute::Color => fields.push(Field::F32(vec![pack_rgb(
                    chunk.colors.as_ref().map_or([0; 3], |c| c[i]),
                )])),
                Attribute::Intensity => fields.push(Field::F32(vec![chunk
                    .intensities
                    .as_ref()
                    .map_or(0.0, |c| c[i] as f32)])),
                Attribute::Classification => fields.push(Field::U8(vec![chunk
                    .classifications
                    .as_ref()
                    .map_or(0, |c| c[i])])),
                Attribute::Normal => fields.extend(
                    chunk
                        .normals
                        .as_ref()
                        .map_or([0.0; 3], |c| c[i])
                        .iter()
                        .map(|v| Field::F32(vec![*v])),
                ),
                Attribute::GpsTime => fields.push(Field::F64(vec![chunk
                    .gps_times
                    .as_ref()
                    .map_or(0.0, |c| c[i])])),
                Attribute::Scalar(name) => {
                    fields.push(Field::F64(vec![chunk.scalar(name).map_or(0.0, |c| c[i])]))
                }
            }
        }
        DynRecord(fields)
    }
}

impl PointSink for PcdSink {
    fn write_chunk(&mut self, chunk: &PointChunk) -> Result<()> {
        let records: Vec<DynRecord> = (0..chunk.len()).map(|i| self.record(chunk, i)).collect();
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("PCD writer is already closed"))
            .for_destination(&self.path)?;
        for record in &records {
            writer
                .push(record)
                .context("Failed to write PCD point")
                .for_destination(&self.path)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer
                .finish()
                .context("Failed to finalize PCD file")
                .for_destination(&self.path)?;
        }
        Ok(())
    }
}
