use std::fs;
use std::path::{Path, PathBuf};

use approx::assert_abs_diff_eq;
use pcconvert::commands::pointcloud::convert::execute;
use pcconvert::commands::pointcloud::pipeline::{convert, Job, Pipeline, State};
use pcconvert::errors::{ConvertError, Result};
use pcconvert::formats::{
    Format, PointFormat, PointSink, PointSource, SinkOptions, SourceInfo,
};
use pcconvert::points::{Attribute, PointChunk, PointRecord, Schema};
use pcconvert::shared::config::Settings;
use pcconvert::shared::progress::{Reporter, Stream, Verbosity};
use pcconvert::ConvertArgs;

fn silent() -> Reporter {
    Reporter::new(Verbosity::Silent)
}

fn run(origin: &Path, from: Format, destination: &Path, to: Format) -> Result<u64> {
    let job = Job {
        origin,
        source_format: &from,
        destination,
        destination_format: &to,
        text_encoding: false,
    };
    convert(&job, &mut silent()).map(|summary| summary.points)
}

fn read_all(path: &Path, format: Format) -> (Schema, PointChunk) {
    let mut source = format.open_read(path).unwrap();
    let schema = source.info().schema.clone();
    let mut all = PointChunk::for_schema(&schema, 0);
    while let Some(chunk) = source.read_chunk().unwrap() {
        all.positions.extend(chunk.positions);
        if let (Some(all), Some(c)) = (all.colors.as_mut(), chunk.colors) {
            all.extend(c);
        }
        if let (Some(all), Some(c)) = (all.intensities.as_mut(), chunk.intensities) {
            all.extend(c);
        }
        if let (Some(all), Some(c)) = (all.classifications.as_mut(), chunk.classifications) {
            all.extend(c);
        }
    }
    source.close().unwrap();
    (schema, all)
}

const SCAN: &str = "// four points\n4\n\
10.5 -3.25 100.125 120 255 0 0\n\
11.0 -2.75 100.5 900 0 255 0\n\
11.5 -2.25 101.0 0 0 0 255\n\
12.0 -1.75 99.875 65535 10 20 30\n";

fn write_scan(dir: &Path) -> PathBuf {
    let path = dir.join("scan.pts");
    fs::write(&path, SCAN).unwrap();
    path
}

#[test]
fn pts_ply_pts_round_trip_is_lossless() {
    let dir = tempfile::tempdir().unwrap();
    let origin = write_scan(dir.path());
    let ply = dir.path().join("scan.ply");
    let back = dir.path().join("back.pts");

    assert_eq!(run(&origin, Format::Pts, &ply, Format::Ply).unwrap(), 4);
    assert_eq!(run(&ply, Format::Ply, &back, Format::Pts).unwrap(), 4);

    let (schema, original) = read_all(&origin, Format::Pts);
    let (round_schema, round) = read_all(&back, Format::Pts);
    assert_eq!(schema, round_schema);
    assert_eq!(original, round);
}

#[test]
fn las_keeps_positions_within_quantization() {
    let dir = tempfile::tempdir().unwrap();
    let origin = write_scan(dir.path());
    let las = dir.path().join("scan.laz");
    let ply = dir.path().join("from_las.ply");

    run(&origin, Format::Pts, &las, Format::Laz).unwrap();
    run(&las, Format::Laz, &ply, Format::Ply).unwrap();

    let (_, original) = read_all(&origin, Format::Pts);
    let (schema, converted) = read_all(&ply, Format::Ply);
    assert!(schema.contains(&Attribute::Classification));
    assert_eq!(original.len(), converted.len());
    for (a, b) in original.positions.iter().zip(&converted.positions) {
        for axis in 0..3 {
            assert_abs_diff_eq!(a[axis], b[axis], epsilon = 1e-6);
        }
    }
    assert_eq!(original.intensities, converted.intensities);
    assert_eq!(original.colors, converted.colors);
}

#[test]
fn e57_and_pcd_preserve_count_and_order() {
    let dir = tempfile::tempdir().unwrap();
    let origin = write_scan(dir.path());
    let e57 = dir.path().join("scan.e57");
    let pcd = dir.path().join("scan.pcd");

    run(&origin, Format::Pts, &e57, Format::E57).unwrap();
    run(&e57, Format::E57, &pcd, Format::Pcd).unwrap();

    let (_, original) = read_all(&origin, Format::Pts);
    let (_, converted) = read_all(&pcd, Format::Pcd);
    assert_eq!(original.positions, converted.positions);
    assert_eq!(original.colors, converted.colors);
    assert_eq!(original.intensities, converted.intensities);
}

#[test]
fn unsupported_attribute_is_dropped_once() {
    let dir = tempfile::tempdir().unwrap();
    let origin = dir.path().join("classified.ply");
    fs::write(
        &origin,
        "ply\nformat ascii 1.0\nelement vertex 2\nproperty double x\nproperty double y\n\
         property double z\nproperty uchar classification\nend_header\n1 2 3 6\n4 5 6 2\n",
    )
    .unwrap();
    let destination = dir.path().join("plain.pts");
    let job = Job {
        origin: &origin,
        source_format: &Format::Ply,
        destination: &destination,
        destination_format: &Format::Pts,
        text_encoding: false,
    };
    for verbosity in [Verbosity::Milestones, Verbosity::Machine] {
        let mut reporter = Reporter::capturing(verbosity);
        let summary = convert(&job, &mut reporter).unwrap();
        assert_eq!(summary.points, 2);
        assert_eq!(summary.dropped, vec![Attribute::Classification]);

        let notices: Vec<_> = reporter
            .captured()
            .iter()
            .filter(|(_, line)| line.contains("cannot store classification"))
            .collect();
        assert_eq!(notices.len(), 1, "{:?}", reporter.captured());
        if verbosity == Verbosity::Machine {
            assert_eq!(notices[0].0, Stream::Stderr);
        }
    }

    let (schema, points) = read_all(&destination, Format::Pts);
    assert!(!schema.contains(&Attribute::Classification));
    assert_eq!(points.positions, vec![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
}

/// Produces `chunks` chunks of ten points and fails writing chunk `fail_at`.
struct Faulty {
    chunks: usize,
    fail_at: usize,
}

struct FaultySource {
    info: SourceInfo,
    remaining: usize,
}

impl PointSource for FaultySource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn read_chunk(&mut self) -> Result<Option<PointChunk>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let mut chunk = PointChunk::for_schema(&self.info.schema, 10);
        for i in 0..10 {
            chunk.push(&PointRecord {
                position: [i as f64, self.remaining as f64, 0.0],
                ..Default::default()
            });
        }
        Ok(Some(chunk))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct FaultySink {
    inner: Box<dyn PointSink>,
    path: PathBuf,
    written: usize,
    fail_at: usize,
}

impl PointSink for FaultySink {
    fn write_chunk(&mut self, chunk: &PointChunk) -> Result<()> {
        if self.written == self.fail_at {
            return Err(ConvertError::destination_format(
                &self.path,
                anyhow::anyhow!("disk went away"),
            ));
        }
        self.written += 1;
        self.inner.write_chunk(chunk)
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

impl PointFormat for Faulty {
    fn name(&self) -> &str {
        "faulty"
    }

    fn stores(&self, _attribute: &Attribute) -> bool {
        true
    }

    fn open_read(&self, _path: &Path) -> Result<Box<dyn PointSource>> {
        let mut info = SourceInfo::new(Schema::new([]));
        info.count = Some(10 * self.chunks as u64);
        Ok(Box::new(FaultySource {
            info,
            remaining: self.chunks,
        }))
    }

    fn open_write(&self, path: &Path, options: &SinkOptions) -> Result<Box<dyn PointSink>> {
        Ok(Box::new(FaultySink {
            inner: Format::Ply.open_write(path, options)?,
            path: path.to_path_buf(),
            written: 0,
            fail_at: self.fail_at,
        }))
    }
}

#[test]
fn failure_on_a_later_chunk_leaves_no_destination() {
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("partial.ply");
    let faulty = Faulty {
        chunks: 5,
        fail_at: 3,
    };
    let job = Job {
        origin: Path::new("unused"),
        source_format: &faulty,
        destination: &destination,
        destination_format: &faulty,
        text_encoding: false,
    };
    let mut pipeline = Pipeline::new(&job);
    let err = pipeline.run(&mut silent()).unwrap_err();
    assert_eq!(err.exit_code(), 6);
    assert_eq!(pipeline.state(), State::Failed);
    assert!(!destination.exists());
}

#[test]
fn failing_source_mid_stream_leaves_no_destination() {
    let dir = tempfile::tempdir().unwrap();
    let origin = dir.path().join("bad.ply");
    let mut bytes = b"ply\nformat binary_little_endian 1.0\nelement vertex 3\n\
property double x\nproperty double y\nproperty double z\nend_header\n"
        .to_vec();
    bytes.extend_from_slice(&[0u8; 24 * 2 + 5]);
    fs::write(&origin, bytes).unwrap();
    let destination = dir.path().join("bad.e57");

    let err = run(&origin, Format::Ply, &destination, Format::E57).unwrap_err();
    assert_eq!(err.exit_code(), 5);
    assert!(!destination.exists());
}

fn args(origin: &Path) -> ConvertArgs {
    ConvertArgs {
        origin: origin.to_path_buf(),
        destination: None,
        extension: None,
        unlocked: false,
        verbose: 0,
        ascii: false,
        potree_converter: None,
    }
}

#[test]
fn defaults_write_las_next_to_origin() {
    let dir = tempfile::tempdir().unwrap();
    let origin = write_scan(dir.path());
    execute(args(&origin), Settings::default(), &mut silent()).unwrap();
    let (_, points) = read_all(&dir.path().join("scan.las"), Format::Las);
    assert_eq!(points.len(), 4);
}

#[test]
fn existing_destination_needs_unlock() {
    let dir = tempfile::tempdir().unwrap();
    let origin = write_scan(dir.path());
    let destination = dir.path().join("out").join("scan.ply");
    fs::create_dir_all(destination.parent().unwrap()).unwrap();
    fs::write(&destination, b"precious").unwrap();

    let mut denied = args(&origin);
    denied.destination = Some(dir.path().join("out"));
    denied.extension = Some("ply".into());
    let err = execute(denied, Settings::default(), &mut silent()).unwrap_err();
    assert!(matches!(err, ConvertError::OverwriteDenied(_)));
    assert_eq!(fs::read(&destination).unwrap(), b"precious");

    let mut unlocked = args(&origin);
    unlocked.destination = Some(destination.clone());
    unlocked.unlocked = true;
    execute(unlocked, Settings::default(), &mut silent()).unwrap();
    let (_, points) = read_all(&destination, Format::Ply);
    assert_eq!(points.len(), 4);
}

#[test]
fn converting_onto_itself_goes_through_staging() {
    let dir = tempfile::tempdir().unwrap();
    let origin = write_scan(dir.path());

    let mut same = args(&origin);
    same.extension = Some(".pts".into());
    assert!(matches!(
        execute(same, Settings::default(), &mut silent()),
        Err(ConvertError::OverwriteDenied(_))
    ));

    let mut same = args(&origin);
    same.extension = Some(".pts".into());
    same.unlocked = true;
    execute(same, Settings::default(), &mut silent()).unwrap();

    let (_, points) = read_all(&origin, Format::Pts);
    assert_eq!(points.len(), 4);
    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(leftovers.len(), 1);
}

#[test]
fn unknown_origin_extension_is_a_source_format_error() {
    let dir = tempfile::tempdir().unwrap();
    let origin = dir.path().join("scan.xyz");
    fs::write(&origin, SCAN).unwrap();
    let err = execute(args(&origin), Settings::default(), &mut silent()).unwrap_err();
    assert_eq!(err.exit_code(), 5);
    assert!(!dir.path().join("scan.las").exists());
}

#[test]
fn missing_origin_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let err = execute(
        args(&dir.path().join("nothing.e57")),
        Settings::default(),
        &mut silent(),
    )
    .unwrap_err();
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn potree_without_converter_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let origin = write_scan(dir.path());
    let mut potree = args(&origin);
    potree.extension = Some("potree".into());
    potree.potree_converter = Some(dir.path().join("missing-tool"));
    let err = execute(potree, Settings::default(), &mut silent()).unwrap_err();
    assert_eq!(err.exit_code(), 7);
    assert!(!dir.path().join("scan_potree").exists());
}
