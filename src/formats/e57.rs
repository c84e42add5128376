//! E57 adapter. The e57 readers and writers borrow their container, so each side runs on a
//! helper thread that owns the file and talks to the pipeline over a bounded channel.

use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context};
use crossbeam::channel::{self, Receiver, Sender};
use e57::{
    CartesianCoordinate, E57Reader, E57Writer, Record, RecordDataType, RecordName, RecordValue,
};

use crate::errors::{ConvertError, FormatContext, Result};
use crate::formats::{PointSink, PointSource, SinkOptions, SourceInfo};
use crate::points::{narrow_color, Attribute, PointChunk, PointRecord, Schema, CHUNK_SIZE};

/// Chunks in flight between a helper thread and the pipeline.
const CHANNEL_DEPTH: usize = 2;

pub fn stores(attribute: &Attribute) -> bool {
    matches!(
        attribute,
        Attribute::Position | Attribute::Color | Attribute::Intensity
    )
}

/// Scales a normalized e57 value back to the model's 16 bit range.
fn denormalize(value: f32) -> u16 {
    (value.clamp(0.0, 1.0) * u16::MAX as f32).round() as u16
}

enum Incoming {
    /// Stream layout and the number of stored records, valid or not.
    Info(SourceInfo, u64),
    /// A chunk and the number of records consumed up to its end.
    Chunk(PointChunk, u64),
    Failed(anyhow::Error),
}

fn stream_points(path: &Path, sender: &Sender<Incoming>) -> anyhow::Result<()> {
    let mut reader = E57Reader::from_file(path).context("Could not read E57 header")?;
    let pointclouds = reader.pointclouds();
    if pointclouds.len() > 1 {
        log::warn!(
            "{} holds {} point clouds, only the first one is converted",
            path.display(),
            pointclouds.len()
        );
    }
    let Some(pc) = pointclouds.first() else {
        let mut info = SourceInfo::new(Schema::new([]));
        info.count = Some(0);
        let _ = sender.send(Incoming::Info(info, 0));
        return Ok(());
    };

    let has = |name: RecordName| pc.prototype.iter().any(|r| r.name == name);
    let mut attributes = Vec::new();
    if has(RecordName::ColorRed) && has(RecordName::ColorGreen) && has(RecordName::ColorBlue) {
        attributes.push(Attribute::Color);
    }
    if has(RecordName::Intensity) {
        attributes.push(Attribute::Intensity);
    }
    let schema = Schema::new(attributes);
    let mut info = SourceInfo::new(schema.clone());
    // Points flagged invalid are skipped, so the stored record count is only exact without them.
    if !has(RecordName::CartesianInvalidState) && !has(RecordName::SphericalInvalidState) {
        info.count = Some(pc.records);
    }
    if sender.send(Incoming::Info(info, pc.records)).is_err() {
        return Ok(());
    }

    let points = reader
        .pointcloud_simple(pc)
        .context("Could not open E57 point data")?;
    let mut chunk = PointChunk::for_schema(&schema, CHUNK_SIZE);
    let mut skipped = 0u64;
    let mut consumed = 0u64;
    for point in points {
        let point = point.context("Failed to decode E57 point")?;
        consumed += 1;
        let CartesianCoordinate::Valid { x, y, z } = point.cartesian else {
            skipped += 1;
            continue;
        };
        chunk.push(&PointRecord {
            position: [x, y, z],
            color: point
                .color
                .map(|c| [denormalize(c.red), denormalize(c.green), denormalize(c.blue)])
                .unwrap_or_default(),
            intensity: point.intensity.map(denormalize).unwrap_or_default(),
            ..Default::default()
        });
        if chunk.len() == CHUNK_SIZE {
            let full = std::mem::replace(&mut chunk, PointChunk::for_schema(&schema, CHUNK_SIZE));
            if sender.send(Incoming::Chunk(full, consumed)).is_err() {
                return Ok(());
            }
        }
    }
    if skipped > 0 {
        log::info!("skipped {} E57 points without valid coordinates", skipped);
    }
    if !chunk.is_empty() {
        let _ = sender.send(Incoming::Chunk(chunk, consumed));
    }
    Ok(())
}

pub struct E57Source {
    path: PathBuf,
    receiver: Option<Receiver<Incoming>>,
    handle: Option<JoinHandle<()>>,
    info: SourceInfo,
    records: u64,
    consumed: u64,
}

impl E57Source {
    pub fn open(path: &Path) -> Result<Self> {
        let (sender, receiver) = channel::bounded(CHANNEL_DEPTH);
        let thread_path = path.to_path_buf();
        let handle = thread::spawn(move || {
            if let Err(e) = stream_points(&thread_path, &sender) {
                let _ = sender.send(Incoming::Failed(e));
            }
        });

        let (info, records) = match receiver.recv() {
            Ok(Incoming::Info(info, records)) => (info, records),
            Ok(Incoming::Failed(e)) => return Err(ConvertError::source_format(path, e)),
            Ok(Incoming::Chunk(..)) | Err(_) => {
                return Err(ConvertError::source_format(
                    path,
                    anyhow!("E57 reader stopped before reporting its layout"),
                ))
            }
        };
        log::debug!(
            "opened {} with {:?} points, schema {}",
            path.display(),
            info.count,
            info.schema
        );

        Ok(E57Source {
            path: path.to_path_buf(),
            receiver: Some(receiver),
            handle: Some(handle),
            info,
            records,
            consumed: 0,
        })
    }
}

impl PointSource for E57Source {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn read_chunk(&mut self) -> Result<Option<PointChunk>> {
        let Some(receiver) = self.receiver.as_ref() else {
            return Ok(None);
        };
        match receiver.recv() {
            Ok(Incoming::Chunk(chunk, consumed)) => {
                self.consumed = consumed;
                Ok(Some(chunk))
            }
            Ok(Incoming::Failed(e)) => Err(ConvertError::source_format(&self.path, e)),
            Ok(Incoming::Info(..)) => Err(ConvertError::source_format(
                &self.path,
                anyhow!("E57 reader reported its layout twice"),
            )),
            Err(_) => {
                // Trailing invalid records never arrive in a chunk.
                self.consumed = self.records;
                Ok(None)
            }
        }
    }

    fn progress(&self) -> Option<(u64, u64)> {
        Some((self.consumed, self.records))
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the receiver unblocks a helper that is waiting to send.
        self.receiver = None;
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| anyhow!("E57 reader thread panicked"))
                .for_source(&self.path)?;
        }
        Ok(())
    }
}

impl Drop for E57Source {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

enum Outgoing {
    Chunk(PointChunk),
    Finish,
}

fn prototype(schema: &Schema) -> Vec<Record> {
    let mut records = vec![
        Record::CARTESIAN_X_F64,
        Record::CARTESIAN_Y_F64,
        Record::CARTESIAN_Z_F64,
    ];
    if schema.contains(&Attribute::Color) {
        for name in [
            RecordName::ColorRed,
            RecordName::ColorGreen,
            RecordName::ColorBlue,
        ] {
            records.push(Record {
                name,
                data_type: RecordDataType::Integer { min: 0, max: 255 },
            });
        }
    }
    if schema.contains(&Attribute::Intensity) {
        records.push(Record {
            name: RecordName::Intensity,
            data_type: RecordDataType::Integer {
                min: 0,
                max: u16::MAX as i64,
            },
        });
    }
    records
}

fn values(chunk: &PointChunk, i: usize, color: bool, intensity: bool) -> Vec<RecordValue> {
    let mut values: Vec<RecordValue> = chunk.positions[i]
        .iter()
        .map(|v| RecordValue::Double(*v))
        .collect();
    if color {
        let rgb = chunk.colors.as_ref().map_or([0; 3], |c| c[i]);
        values.extend(rgb.iter().map(|c| RecordValue::Integer(narrow_color(*c) as i64)));
    }
    if intensity {
        let value = chunk.intensities.as_ref().map_or(0, |c| c[i]);
        values.push(RecordValue::Integer(value as i64));
    }
    values
}

fn write_points(
    path: &Path,
    schema: &Schema,
    ready: Sender<()>,
    commands: Receiver<Outgoing>,
) -> anyhow::Result<()> {
    let file_guid = uuid::Uuid::new_v4().to_string();
    let mut writer =
        E57Writer::from_file(path, &file_guid).context("Could not create E57 file")?;
    let cloud_guid = uuid::Uuid::new_v4().to_string();
    let mut cloud = writer
        .add_pointcloud(&cloud_guid, prototype(schema))
        .context("Could not start E57 point cloud")?;
    let color = schema.contains(&Attribute::Color);
    let intensity = schema.contains(&Attribute::Intensity);
    let _ = ready.send(());

    let mut finished = false;
    for command in commands {
        match command {
            Outgoing::Chunk(chunk) => {
                for i in 0..chunk.len() {
                    cloud
                        .add_point(values(&chunk, i, color, intensity))
                        .context("Failed to write E57 point")?;
                }
            }
            Outgoing::Finish => {
                finished = true;
                break;
            }
        }
    }
    // Only a regular close produces a complete file.
    if !finished {
        bail!("E57 output was abandoned before it was closed");
    }
    cloud
        .finalize()
        .context("Failed to finalize E57 point cloud")?;
    writer.finalize().context("Failed to finalize E57 file")?;
    Ok(())
}

pub struct E57Sink {
    path: PathBuf,
    sender: Option<Sender<Outgoing>>,
    handle: Option<JoinHandle<anyhow::Result<()>>>,
}

impl E57Sink {
    pub fn create(path: &Path, options: &SinkOptions) -> Result<Self> {
        let (ready_sender, ready) = channel::bounded(1);
        let (sender, commands) = channel::bounded(CHANNEL_DEPTH);
        let thread_path = path.to_path_buf();
        let schema = options.schema.clone();
        let handle =
            thread::spawn(move || write_points(&thread_path, &schema, ready_sender, commands));

        let mut sink = E57Sink {
            path: path.to_path_buf(),
            sender: Some(sender),
            handle: Some(handle),
        };
        if ready.recv().is_err() {
            return Err(sink.join_error());
        }
        Ok(sink)
    }

    /// Waits for the helper thread and returns what made it stop.
    fn join_error(&mut self) -> ConvertError {
        self.sender = None;
        let failure = match self.handle.take().map(|h| h.join()) {
            Some(Ok(Err(e))) => e,
            Some(Err(_)) => anyhow!("E57 writer thread panicked"),
            Some(Ok(Ok(()))) | None => anyhow!("E57 writer stopped unexpectedly"),
        };
        ConvertError::destination_format(&self.path, failure)
    }
}

impl PointSink for E57Sink {
    fn write_chunk(&mut self, chunk: &PointChunk) -> Result<()> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(ConvertError::destination_format(
                &self.path,
                anyhow!("E57 writer is already closed"),
            ));
        };
        if sender.send(Outgoing::Chunk(chunk.clone())).is_err() {
            return Err(self.join_error());
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(sender) = self.sender.take() else {
            return Ok(());
        };
        let _ = sender.send(Outgoing::Finish);
        drop(sender);
        match self.handle.take().map(|h| h.join()) {
            Some(Ok(result)) => result.for_destination(&self.path),
            Some(Err(_)) => Err(ConvertError::destination_format(
                &self.path,
                anyhow!("E57 writer thread panicked"),
            )),
            None => Ok(()),
        }
    }
}

impl Drop for E57Sink {
    fn drop(&mut self) {
        // Without a Finish message the helper stops without finalizing.
        self.sender = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
