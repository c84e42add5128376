//! PTS text clouds: an optional point count line, optional `//` comment lines, then one point
//! per line as `x y z [intensity] [r g b]`.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use rayon::prelude::*;

use crate::errors::{ConvertError, FormatContext, Result};
use crate::formats::{PointSink, PointSource, SinkOptions, SourceInfo};
use crate::points::{
    narrow_color, widen_color, Attribute, PointChunk, PointRecord, Schema, CHUNK_SIZE,
};

/// Bytes inspected when checking whether the input is text at all.
const SNIFF_LEN: usize = 4096;

pub fn stores(attribute: &Attribute) -> bool {
    matches!(
        attribute,
        Attribute::Position | Attribute::Intensity | Attribute::Color
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Layout {
    Xyz,
    XyzIntensity,
    XyzColor,
    XyzIntensityColor,
}

impl Layout {
    fn from_columns(columns: usize) -> anyhow::Result<Self> {
        Ok(match columns {
            3 => Layout::Xyz,
            4 => Layout::XyzIntensity,
            6 => Layout::XyzColor,
            7 => Layout::XyzIntensityColor,
            n => bail!("Unsupported PTS layout with {} columns per point", n),
        })
    }

    fn columns(self) -> usize {
        match self {
            Layout::Xyz => 3,
            Layout::XyzIntensity => 4,
            Layout::XyzColor => 6,
            Layout::XyzIntensityColor => 7,
        }
    }

    fn has_intensity(self) -> bool {
        matches!(self, Layout::XyzIntensity | Layout::XyzIntensityColor)
    }

    fn has_color(self) -> bool {
        matches!(self, Layout::XyzColor | Layout::XyzIntensityColor)
    }

    fn schema(self) -> Schema {
        let mut attributes = Vec::new();
        if self.has_intensity() {
            attributes.push(Attribute::Intensity);
        }
        if self.has_color() {
            attributes.push(Attribute::Color);
        }
        Schema::new(attributes)
    }
}

/// PTS has no binary variant that we read. Anything with NUL bytes or broken UTF-8 near the
/// start is rejected before parsing.
fn ensure_text(head: &[u8]) -> anyhow::Result<()> {
    if head.contains(&0) {
        bail!("Binary PTS files are not supported");
    }
    if let Err(e) = std::str::from_utf8(head) {
        // A multi-byte character cut off at the end of the sniffed block is fine.
        if e.error_len().is_some() {
            bail!("Binary PTS files are not supported");
        }
    }
    Ok(())
}

fn is_header_line(line: &str) -> bool {
    line.starts_with("//") || line.chars().all(|c| c.is_ascii_digit())
}

fn parse_line(line: &str, layout: Layout, point: &mut PointRecord) -> anyhow::Result<()> {
    let mut values = [0f64; 7];
    let mut columns = 0;
    for token in line.split_whitespace() {
        if columns == layout.columns() {
            bail!("Expected {} columns", layout.columns());
        }
        values[columns] = token
            .parse()
            .with_context(|| format!("Invalid number '{}'", token))?;
        columns += 1;
    }
    if columns != layout.columns() {
        bail!("Expected {} columns, found {}", layout.columns(), columns);
    }

    point.position = [values[0], values[1], values[2]];
    let mut next = 3;
    if layout.has_intensity() {
        point.intensity = values[next].round().clamp(0.0, u16::MAX as f64) as u16;
        next += 1;
    }
    if layout.has_color() {
        for channel in 0..3 {
            point.color[channel] =
                widen_color(values[next + channel].round().clamp(0.0, u8::MAX as f64) as u8);
        }
    }
    Ok(())
}

pub struct PtsSource {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    layout: Layout,
    /// First data line, consumed while detecting the layout.
    pending: Option<String>,
    line_number: u64,
    /// Bytes read so far and the file length, the progress measure while the count is unknown.
    consumed: u64,
    length: u64,
    info: SourceInfo,
}

impl PtsSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| ConvertError::io(path, e))?;
        let length = file.metadata().map_err(|e| ConvertError::io(path, e))?.len();
        let mut reader = BufReader::with_capacity(64 * 1024, file);
        let head = reader.fill_buf().map_err(|e| ConvertError::io(path, e))?;
        ensure_text(&head[..head.len().min(SNIFF_LEN)]).for_source(path)?;

        let mut line_number = 0;
        let mut consumed = 0;
        let mut pending = None;
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader
                .read_line(&mut line)
                .context("Could not read PTS header")
                .for_source(path)?;
            if read == 0 {
                break;
            }
            consumed += read as u64;
            line_number += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || is_header_line(trimmed) {
                continue;
            }
            pending = Some(trimmed.to_string());
            break;
        }

        // An empty file is a valid cloud without points.
        let layout = match &pending {
            Some(first) => Layout::from_columns(first.split_whitespace().count())
                .with_context(|| format!("line {}", line_number))
                .for_source(path)?,
            None => Layout::Xyz,
        };
        let info = SourceInfo::new(layout.schema());
        log::debug!("opened {} as {:?}", path.display(), layout);

        Ok(PtsSource {
            path: path.to_path_buf(),
            reader: Some(reader),
            layout,
            pending,
            line_number,
            consumed,
            length,
            info,
        })
    }
}

impl PointSource for PtsSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn read_chunk(&mut self) -> Result<Option<PointChunk>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let mut chunk = PointChunk::for_schema(&self.info.schema, CHUNK_SIZE);
        let mut point = PointRecord::default();

        if let Some(first) = self.pending.take() {
            parse_line(&first, self.layout, &mut point)
                .with_context(|| format!("line {}", self.line_number))
                .for_source(&self.path)?;
            chunk.push(&point);
        }

        let mut line = String::new();
        while chunk.len() < CHUNK_SIZE {
            line.clear();
            let read = reader
                .read_line(&mut line)
                .with_context(|| format!("line {} is not text", self.line_number + 1))
                .for_source(&self.path)?;
            if read == 0 {
                self.reader = None;
                break;
            }
            self.consumed += read as u64;
            self.line_number += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            parse_line(trimmed, self.layout, &mut point)
                .with_context(|| format!("line {}", self.line_number))
                .for_source(&self.path)?;
            chunk.push(&point);
        }
        Ok((!chunk.is_empty()).then_some(chunk))
    }

    fn progress(&self) -> Option<(u64, u64)> {
        Some((self.consumed, self.length))
    }

    fn close(&mut self) -> Result<()> {
        self.reader = None;
        self.pending = None;
        Ok(())
    }
}

pub struct PtsSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    layout: Layout,
    expected: u64,
    written: u64,
}

fn format_line(chunk: &PointChunk, i: usize, layout: Layout) -> String {
    let [x, y, z] = chunk.positions[i];
    let mut line = format!("{} {} {}", x, y, z);
    if layout.has_intensity() {
        let intensity = chunk.intensities.as_ref().map_or(0, |c| c[i]);
        line.push_str(&format!(" {}", intensity));
    }
    if layout.has_color() {
        let [r, g, b] = chunk.colors.as_ref().map_or([0; 3], |c| c[i]);
        line.push_str(&format!(
            " {} {} {}",
            narrow_color(r),
            narrow_color(g),
            narrow_color(b)
        ));
    }
    line.push('\n');
    line
}

impl PtsSink {
    pub fn create(path: &Path, options: &SinkOptions) -> Result<Self> {
        let expected = options
            .count
            .ok_or_else(|| anyhow!("PTS output needs the number of points up front"))
            .for_destination(path)?;
        let layout = match (
            options.schema.contains(&Attribute::Intensity),
            options.schema.contains(&Attribute::Color),
        ) {
            (false, false) => Layout::Xyz,
            (true, false) => Layout::XyzIntensity,
            (false, true) => Layout::XyzColor,
            (true, true) => Layout::XyzIntensityColor,
        };

        let file = File::create(path).map_err(|e| ConvertError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", expected).map_err(|e| ConvertError::io(path, e))?;

        Ok(PtsSink {
            path: path.to_path_buf(),
            writer: Some(writer),
            layout,
            expected,
            written: 0,
        })
    }
}

impl PointSink for PtsSink {
    fn write_chunk(&mut self, chunk: &PointChunk) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("PTS writer is already closed"))
            .for_destination(&self.path)?;
        let layout = self.layout;
        let lines: Vec<String> = (0..chunk.len())
            .into_par_iter()
            .map(|i| format_line(chunk, i, layout))
            .collect();
        writer
            .write_all(lines.concat().as_bytes())
            .map_err(|e| ConvertError::io(&self.path, e))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer
            .flush()
            .map_err(|e| ConvertError::io(&self.path, e))?;
        if self.written != self.expected {
            log::warn!(
                "{} announces {} points but {} were written",
                self.path.display(),
                self.expected,
                self.written
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn layouts_follow_column_count() {
        assert_eq!(Layout::from_columns(4).unwrap(), Layout::XyzIntensity);
        assert_eq!(Layout::from_columns(6).unwrap(), Layout::XyzColor);
        assert!(Layout::from_columns(5).is_err());
        assert_eq!(
            Layout::XyzIntensityColor.schema().attributes(),
            &[Attribute::Position, Attribute::Intensity, Attribute::Color]
        );
    }

    #[test]
    fn reads_header_and_points() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "scan.pts",
            b"// exported scan\n3\n1.5 2.5 3.5 -20 255 0 128\n\n\
4 5 6 70000 1 2 3\n7 8 9 100 0 0 0\n",
        );

        let mut source = PtsSource::open(&path).unwrap();
        assert_eq!(source.layout, Layout::XyzIntensityColor);
        let chunk = source.read_chunk().unwrap().unwrap();
        assert_eq!(chunk.len(), 3);
        assert_relative_eq!(chunk.positions[0][1], 2.5);
        assert_eq!(chunk.intensities.as_ref().unwrap(), &vec![0, 65535, 100]);
        assert_eq!(chunk.colors.as_ref().unwrap()[0], [65535, 0, 32896]);
        assert!(source.read_chunk().unwrap().is_none());
    }

    #[test]
    fn binary_input_is_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "binary.pts", &[0x10, 0x00, 0xff, 0xfe, 0x01, 0x02]);
        let err = PtsSource::open(&path).err().unwrap();
        assert_eq!(err.exit_code(), 5);
        let cause = std::error::Error::source(&err).unwrap().to_string();
        assert!(cause.contains("Binary PTS"), "{}", cause);
    }

    #[test]
    fn malformed_line_reports_its_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "broken.pts", b"1 2 3\n4 five 6\n");
        let mut source = PtsSource::open(&path).unwrap();
        let err = source.read_chunk().unwrap_err();
        let cause = std::error::Error::source(&err).unwrap().to_string();
        assert_eq!(cause, "line 2");
    }

    #[test]
    fn progress_counts_bytes_read() {
        let dir = tempfile::tempdir().unwrap();
        let contents = b"2\n1 2 3\n4 5 6\n";
        let path = write_file(&dir, "two.pts", contents);
        let mut source = PtsSource::open(&path).unwrap();
        let (done, total) = source.progress().unwrap();
        assert_eq!(total, contents.len() as u64);
        assert!(done < total);
        source.read_chunk().unwrap().unwrap();
        assert_eq!(source.progress(), Some((total, total)));
    }

    #[test]
    fn empty_file_has_no_points() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "empty.pts", b"");
        let mut source = PtsSource::open(&path).unwrap();
        assert!(source.read_chunk().unwrap().is_none());
    }

    #[test]
    fn writes_count_line_and_narrowed_colors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.pts");
        let schema = Schema::new([Attribute::Color]);
        let mut chunk = PointChunk::for_schema(&schema, 2);
        chunk.push(&PointRecord {
            position: [0.25, -1.0, 3.0],
            color: [65535, 256, 0],
            ..Default::default()
        });
        chunk.push(&PointRecord {
            position: [1.0, 2.0, 3.0],
            ..Default::default()
        });

        let mut options = SinkOptions::new(schema);
        options.count = Some(2);
        let mut sink = PtsSink::create(&path, &options).unwrap();
        sink.write_chunk(&chunk).unwrap();
        sink.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "2\n0.25 -1 3 255 1 0\n1 2 3 0 0 0\n");
    }

    #[test]
    fn sink_without_count_is_a_destination_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.pts");
        let err = PtsSink::create(&path, &SinkOptions::new(Schema::new([])))
            .err()
            .unwrap();
        assert_eq!(err.exit_code(), 6);
        assert!(!path.exists());
    }
}
