//! Streaming PLY reader and writer. Only the `vertex` element is converted; other elements
//! before it are skipped, elements after it are ignored.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::{ConvertError, FormatContext, Result};
use crate::formats::{PointSink, PointSource, SinkOptions, SourceInfo};
use crate::points::{
    narrow_color, widen_color, Attribute, PointChunk, PointRecord, Schema, CHUNK_SIZE,
};

const HEADER_COUNT_PLACEHOLDER: &str = "00000000000000000000";

pub fn stores(_attribute: &Attribute) -> bool {
    true
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum DataType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
}

impl DataType {
    fn parse(input: &str) -> anyhow::Result<Self> {
        Ok(match input {
            "char" | "int8" => DataType::Int8,
            "uchar" | "uint8" => DataType::Uint8,
            "short" | "int16" => DataType::Int16,
            "ushort" | "uint16" => DataType::Uint16,
            "int" | "int32" => DataType::Int32,
            "uint" | "uint32" => DataType::Uint32,
            "float" | "float32" => DataType::Float32,
            "double" | "float64" => DataType::Float64,
            _ => bail!("Invalid PLY data type: {}", input),
        })
    }

    fn size(self) -> usize {
        match self {
            DataType::Int8 | DataType::Uint8 => 1,
            DataType::Int16 | DataType::Uint16 => 2,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 4,
            DataType::Float64 => 8,
        }
    }

    fn is_float(self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum Encoding {
    Ascii,
    BinaryLittleEndian,
    BinaryBigEndian,
}

#[derive(Debug)]
struct Property {
    name: String,
    data_type: DataType,
    /// Type of the length prefix for list properties.
    list_count: Option<DataType>,
}

#[derive(Debug)]
struct Element {
    name: String,
    count: u64,
    properties: Vec<Property>,
}

#[derive(Debug)]
struct Header {
    encoding: Encoding,
    elements: Vec<Element>,
}

fn parse_header<R: BufRead>(reader: &mut R) -> anyhow::Result<Header> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim() != "ply" {
        bail!("Not a PLY file");
    }

    let mut encoding = None;
    let mut elements: Vec<Element> = Vec::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            bail!("PLY header ends before end_header");
        }
        let entries: Vec<&str> = line.split_whitespace().collect();
        match entries.as_slice() {
            ["format", kind, version] => {
                if *version != "1.0" {
                    bail!("Invalid PLY version: {}", version);
                }
                encoding = Some(match *kind {
                    "ascii" => Encoding::Ascii,
                    "binary_little_endian" => Encoding::BinaryLittleEndian,
                    "binary_big_endian" => Encoding::BinaryBigEndian,
                    _ => bail!("Invalid PLY format: {}", kind),
                });
            }
            ["element", name, count] => elements.push(Element {
                name: name.to_string(),
                count: count
                    .parse()
                    .with_context(|| format!("Invalid element count: {}", count))?,
                properties: Vec::new(),
            }),
            ["property", "list", count_type, data_type, name] => {
                let element = elements
                    .last_mut()
                    .ok_or_else(|| anyhow!("property outside of element: {}", line.trim()))?;
                element.properties.push(Property {
                    name: name.to_string(),
                    data_type: DataType::parse(data_type)?,
                    list_count: Some(DataType::parse(count_type)?),
                });
            }
            ["property", data_type, name] => {
                let element = elements
                    .last_mut()
                    .ok_or_else(|| anyhow!("property outside of element: {}", line.trim()))?;
                element.properties.push(Property {
                    name: name.to_string(),
                    data_type: DataType::parse(data_type)?,
                    list_count: None,
                });
            }
            ["end_header"] => break,
            ["comment", ..] | ["obj_info", ..] | [] => {}
            _ => bail!("Invalid PLY header line: {}", line.trim()),
        }
    }

    Ok(Header {
        encoding: encoding.ok_or_else(|| anyhow!("No PLY format specified"))?,
        elements,
    })
}

fn read_binary<B: ByteOrder, R: Read>(reader: &mut R, data_type: DataType) -> io::Result<f64> {
    Ok(match data_type {
        DataType::Int8 => reader.read_i8()? as f64,
        DataType::Uint8 => reader.read_u8()? as f64,
        DataType::Int16 => reader.read_i16::<B>()? as f64,
        DataType::Uint16 => reader.read_u16::<B>()? as f64,
        DataType::Int32 => reader.read_i32::<B>()? as f64,
        DataType::Uint32 => reader.read_u32::<B>()? as f64,
        DataType::Float32 => reader.read_f32::<B>()? as f64,
        DataType::Float64 => reader.read_f64::<B>()?,
    })
}

fn read_value<R: Read>(reader: &mut R, encoding: Encoding, data_type: DataType) -> io::Result<f64> {
    match encoding {
        Encoding::BinaryBigEndian => read_binary::<BigEndian, _>(reader, data_type),
        _ => read_binary::<LittleEndian, _>(reader, data_type),
    }
}

/// Skips all records of an element that precedes the vertices.
fn skip_element<R: BufRead>(
    reader: &mut R,
    encoding: Encoding,
    element: &Element,
) -> anyhow::Result<()> {
    if encoding == Encoding::Ascii {
        let mut line = String::new();
        for _ in 0..element.count {
            line.clear();
            reader.read_line(&mut line)?;
        }
        return Ok(());
    }
    for _ in 0..element.count {
        for property in &element.properties {
            let items = match property.list_count {
                Some(count_type) => read_value(reader, encoding, count_type)? as u64,
                None => 1,
            };
            let bytes = items * property.data_type.size() as u64;
            io::copy(&mut reader.by_ref().take(bytes), &mut io::sink())?;
        }
    }
    Ok(())
}

/// Where a vertex property ends up in the point model.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Slot {
    X,
    Y,
    Z,
    Red,
    Green,
    Blue,
    Intensity,
    Classification,
    NormalX,
    NormalY,
    NormalZ,
    GpsTime,
    Scalar(usize),
}

fn slot_for(name: &str) -> Option<Slot> {
    Some(match name.to_lowercase().as_str() {
        "x" => Slot::X,
        "y" => Slot::Y,
        "z" => Slot::Z,
        "r" | "red" | "diffuse_red" => Slot::Red,
        "g" | "green" | "diffuse_green" => Slot::Green,
        "b" | "blue" | "diffuse_blue" => Slot::Blue,
        "classification" | "scalar_classification" | "class" => Slot::Classification,
        "nx" | "normal_x" => Slot::NormalX,
        "ny" | "normal_y" => Slot::NormalY,
        "nz" | "normal_z" => Slot::NormalZ,
        "gps_time" | "gpstime" | "scalar_gps_time" => Slot::GpsTime,
        "intensity" | "intensities" | "scalar_intensity" | "scalar_intensities" => Slot::Intensity,
        _ => return None,
    })
}

/// Maps the vertex properties to slots and derives the stream schema. Color and normal are
/// only taken if all three components are present, otherwise their parts stay scalar fields.
fn map_properties(vertex: &Element) -> anyhow::Result<(Vec<(Slot, DataType)>, Schema)> {
    if let Some(list) = vertex.properties.iter().find(|p| p.list_count.is_some()) {
        bail!("List property '{}' on vertices is not supported", list.name);
    }
    let mut slots: Vec<Option<Slot>> = vertex
        .properties
        .iter()
        .map(|p| slot_for(&p.name))
        .collect();
    let has = |slots: &[Option<Slot>], wanted: &[Slot]| {
        wanted.iter().all(|w| slots.iter().any(|s| *s == Some(*w)))
    };
    if !has(&slots, &[Slot::X, Slot::Y, Slot::Z]) {
        bail!("PLY vertices must have 'x', 'y' and 'z' properties");
    }
    let color = has(&slots, &[Slot::Red, Slot::Green, Slot::Blue]);
    let normal = has(&slots, &[Slot::NormalX, Slot::NormalY, Slot::NormalZ]);

    let mut attributes = Vec::new();
    let mut scalar_count = 0;
    for (slot, property) in slots.iter_mut().zip(&vertex.properties) {
        let demote = match *slot {
            Some(Slot::Red | Slot::Green | Slot::Blue) => !color,
            Some(Slot::NormalX | Slot::NormalY | Slot::NormalZ) => !normal,
            _ => false,
        };
        match *slot {
            Some(s) if !demote => match s {
                Slot::Red => attributes.push(Attribute::Color),
                Slot::NormalX => attributes.push(Attribute::Normal),
                Slot::Intensity => attributes.push(Attribute::Intensity),
                Slot::Classification => attributes.push(Attribute::Classification),
                Slot::GpsTime => attributes.push(Attribute::GpsTime),
                _ => {}
            },
            _ => {
                *slot = Some(Slot::Scalar(scalar_count));
                scalar_count += 1;
                attributes.push(Attribute::Scalar(property.name.clone()));
            }
        }
    }

    let slots = slots
        .into_iter()
        .zip(&vertex.properties)
        .filter_map(|(slot, p)| slot.map(|s| (s, p.data_type)))
        .collect();
    Ok((slots, Schema::new(attributes)))
}

fn to_color(value: f64, data_type: DataType) -> u16 {
    match data_type {
        DataType::Uint8 => widen_color(value as u8),
        t if t.is_float() => (value.clamp(0.0, 1.0) * u16::MAX as f64).round() as u16,
        _ => value.clamp(0.0, u16::MAX as f64) as u16,
    }
}

fn assign(point: &mut PointRecord, slot: Slot, data_type: DataType, value: f64) {
    match slot {
        Slot::X => point.position[0] = value,
        Slot::Y => point.position[1] = value,
        Slot::Z => point.position[2] = value,
        Slot::Red => point.color[0] = to_color(value, data_type),
        Slot::Green => point.color[1] = to_color(value, data_type),
        Slot::Blue => point.color[2] = to_color(value, data_type),
        Slot::Intensity => point.intensity = value.round().clamp(0.0, u16::MAX as f64) as u16,
        Slot::Classification => point.classification = value.clamp(0.0, u8::MAX as f64) as u8,
        Slot::NormalX => point.normal[0] = value as f32,
        Slot::NormalY => point.normal[1] = value as f32,
        Slot::NormalZ => point.normal[2] = value as f32,
        Slot::GpsTime => point.gps_time = value,
        Slot::Scalar(i) => point.scalars[i] = value,
    }
}

pub struct PlySource {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    encoding: Encoding,
    slots: Vec<(Slot, DataType)>,
    remaining: u64,
    info: SourceInfo,
    line: String,
}

impl PlySource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| ConvertError::io(path, e))?;
        let mut reader = BufReader::new(file);
        let header = parse_header(&mut reader)
            .context("Could not parse PLY header")
            .for_source(path)?;

        let vertex_index = header
            .elements
            .iter()
            .position(|e| e.name == "vertex")
            .ok_or_else(|| anyhow!("PLY file has no 'vertex' element"))
            .for_source(path)?;
        for element in &header.elements[..vertex_index] {
            skip_element(&mut reader, header.encoding, element)
                .with_context(|| format!("Could not skip PLY element '{}'", element.name))
                .for_source(path)?;
        }
        let vertex = &header.elements[vertex_index];
        let (slots, schema) = map_properties(vertex).for_source(path)?;

        let mut info = SourceInfo::new(schema);
        info.count = Some(vertex.count);
        log::debug!(
            "opened {} ({:?}) with {} vertices, schema {}",
            path.display(),
            header.encoding,
            vertex.count,
            info.schema
        );

        Ok(PlySource {
            path: path.to_path_buf(),
            reader: Some(reader),
            encoding: header.encoding,
            slots,
            remaining: vertex.count,
            info,
            line: String::new(),
        })
    }

    fn read_point(&mut self, point: &mut PointRecord) -> anyhow::Result<()> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| anyhow!("PLY reader is closed"))?;
        if self.encoding == Encoding::Ascii {
            self.line.clear();
            if reader.read_line(&mut self.line)? == 0 {
                bail!("PLY file ends before all vertices were read");
            }
            let mut tokens = self.line.split_whitespace();
            for (slot, data_type) in &self.slots {
                let token = tokens.next().ok_or_else(|| {
                    anyhow!("Too few values in vertex line '{}'", self.line.trim())
                })?;
                let value: f64 = token
                    .parse()
                    .with_context(|| format!("Invalid vertex value '{}'", token))?;
                assign(point, *slot, *data_type, value);
            }
        } else {
            for (slot, data_type) in &self.slots {
                let value = read_value(reader, self.encoding, *data_type)
                    .context("PLY file ends before all vertices were read")?;
                assign(point, *slot, *data_type, value);
            }
        }
        Ok(())
    }
}

impl PointSource for PlySource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn read_chunk(&mut self) -> Result<Option<PointChunk>> {
        if self.remaining == 0 || self.reader.is_none() {
            return Ok(None);
        }
        let n = self.remaining.min(CHUNK_SIZE as u64) as usize;
        let mut chunk = PointChunk::for_schema(&self.info.schema, n);
        let mut point = PointRecord {
            scalars: vec![0.0; self.info.schema.scalar_names().count()],
            ..Default::default()
        };
        for _ in 0..n {
            if let Err(e) = self.read_point(&mut point) {
                return Err(ConvertError::source_format(&self.path, e));
            }
            chunk.push(&point);
        }
        self.remaining -= n as u64;
        Ok(Some(chunk))
    }

    fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}

pub struct PlySink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    ascii: bool,
    schema: Schema,
    count: u64,
    count_offset: u64,
}

/// Header name for a scalar field. Names the reader would take for a built-in attribute get
/// a `scalar_` prefix.
fn scalar_property_name(name: &str) -> String {
    let mut name = name.split_whitespace().collect::<Vec<_>>().join("_");
    while slot_for(&name).is_some() {
        name = format!("scalar_{}", name);
    }
    name
}

impl PlySink {
    pub fn create(path: &Path, options: &SinkOptions) -> Result<Self> {
        let ascii = options.text_encoding;
        let format = if ascii {
            "ascii"
        } else {
            "binary_little_endian"
        };
        let prefix = format!(
            "ply\nformat {} 1.0\ncomment written by pcconvert\nelement vertex ",
            format
        );
        let mut header = format!("{}{}\n", prefix, HEADER_COUNT_PLACEHOLDER);
        for attribute in options.schema.attributes() {
            let properties: &[(&str, &str)] = match attribute {
                Attribute::Position => &[("double", "x"), ("double", "y"), ("double", "z")],
                Attribute::Color => &[("uchar", "red"), ("uchar", "green"), ("uchar", "blue")],
                Attribute::Intensity => &[("ushort", "intensity")],
                Attribute::Classification => &[("uchar", "classification")],
                Attribute::Normal => &[("float", "nx"), ("float", "ny"), ("float", "nz")],
                Attribute::GpsTime => &[("double", "gps_time")],
                Attribute::Scalar(name) => {
                    header.push_str(&format!("property double {}\n", scalar_property_name(name)));
                    &[]
                }
            };
            for (data_type, name) in properties {
                header.push_str(&format!("property {} {}\n", data_type, name));
            }
        }
        header.push_str("end_header\n");

        let file = File::create(path).map_err(|e| ConvertError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(header.as_bytes())
            .map_err(|e| ConvertError::io(path, e))?;

        Ok(PlySink {
            path: path.to_path_buf(),
            writer: Some(writer),
            ascii,
            schema: options.schema.clone(),
            count: 0,
            count_offset: prefix.len() as u64,
        })
    }

    fn encode_binary(&self, chunk: &PointChunk, i: usize, out: &mut Vec<u8>) -> io::Result<()> {
        for attribute in self.schema.attributes() {
            match attribute {
                Attribute::Position => {
                    for v in chunk.positions[i] {
                        out.write_f64::<LittleEndian>(v)?;
                    }
                }
                Attribute::Color => {
                    let color = chunk.colors.as_ref().map_or([0; 3], |c| c[i]);
                    for v in color {
                        out.write_u8(narrow_color(v))?;
                    }
                }
                Attribute::Intensity => {
                    out.write_u16::<LittleEndian>(chunk.intensities.as_ref().map_or(0, |c| c[i]))?
                }
                Attribute::Classification => {
                    out.write_u8(chunk.classifications.as_ref().map_or(0, |c| c[i]))?
                }
                Attribute::Normal => {
                    for v in chunk.normals.as_ref().map_or([0.0; 3], |c| c[i]) {
                        out.write_f32::<LittleEndian>(v)?;
                    }
                }
                Attribute::GpsTime => {
                    out.write_f64::<LittleEndian>(chunk.gps_times.as_ref().map_or(0.0, |c| c[i]))?
                }
                Attribute::Scalar(name) => {
                    out.write_f64::<LittleEndian>(chunk.scalar(name).map_or(0.0, |c| c[i]))?
                }
            }
        }
        Ok(())
    }

    fn encode_ascii(&self, chunk: &PointChunk, i: usize, out: &mut Vec<u8>) -> io::Result<()> {
        let mut values: Vec<String> = Vec::new();
        for attribute in self.schema.attributes() {
            match attribute {
                Attribute::Position => {
                    values.extend(chunk.positions[i].iter().map(|v| v.to_string()))
                }
                Attribute::Color => values.extend(
                    chunk
                        .colors
                        .as_ref()
                        .map_or([0; 3], |c| c[i])
                        .iter()
                        .map(|v| narrow_color(*v).to_string()),
                ),
                Attribute::Intensity => {
                    values.push(chunk.intensities.as_ref().map_or(0, |c| c[i]).to_string())
                }
                Attribute::Classification => {
                    values.push(chunk.classifications.as_ref().map_or(0, |c| c[i]).to_string())
                }
                Attribute::Normal => values.extend(
                    chunk
                        .normals
                        .as_ref()
                        .map_or([0.0; 3], |c| c[i])
                        .iter()
                        .map(|v| v.to_string()),
                ),
                Attribute::GpsTime => {
                    values.push(chunk.gps_times.as_ref().map_or(0.0, |c| c[i]).to_string())
                }
                Attribute::Scalar(name) => {
                    values.push(chunk.scalar(name).map_or(0.0, |c| c[i]).to_string())
                }
            }
        }
        writeln!(out, "{}", values.join(" "))
    }
}

impl PointSink for PlySink {
    fn write_chunk(&mut self, chunk: &PointChunk) -> Result<()> {
        let mut buffer = Vec::new();
        for i in 0..chunk.len() {
            let encoded = if self.ascii {
                self.encode_ascii(chunk, i, &mut buffer)
            } else {
                self.encode_binary(chunk, i, &mut buffer)
            };
            encoded.map_err(|e| ConvertError::io(&self.path, e))?;
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("PLY writer is already closed"))
            .for_destination(&self.path)?;
        writer
            .write_all(&buffer)
            .map_err(|e| ConvertError::io(&self.path, e))?;
        self.count += chunk.len() as u64;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        let count = format!("{:0width$}", self.count, width = HEADER_COUNT_PLACEHOLDER.len());
        writer
            .seek(SeekFrom::Start(self.count_offset))
            .and_then(|_| writer.write_all(count.as_bytes()))
            .and_then(|_| writer.flush())
            .map_err(|e| ConvertError::io(&self.path, e))
    }
}
