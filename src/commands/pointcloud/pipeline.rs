//! Streams a source into a sink chunk by chunk. The whole conversion succeeds or leaves
//! nothing behind at the destination.

use std::fs;
use std::path::Path;

use itertools::Itertools;

use crate::errors::Result;
use crate::formats::{PointFormat, SinkOptions};
use crate::points::{Attribute, Bounds};
use crate::shared::progress::{Phase, ProgressState, Reporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    SourceOpened,
    Converting,
    Finalizing,
    Done,
    Failed,
}

/// One origin to one destination file, both with an explicit format.
pub struct Job<'a> {
    pub origin: &'a Path,
    pub source_format: &'a dyn PointFormat,
    pub destination: &'a Path,
    pub destination_format: &'a dyn PointFormat,
    pub text_encoding: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub points: u64,
    pub dropped: Vec<Attribute>,
}

pub struct Pipeline<'a> {
    job: &'a Job<'a>,
    state: State,
    /// Set once the destination may have been created.
    destination_touched: bool,
}

impl<'a> Pipeline<'a> {
    pub fn new(job: &'a Job<'a>) -> Self {
        Pipeline {
            job,
            state: State::Idle,
            destination_touched: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    fn transition(&mut self, state: State) {
        log::debug!("pipeline {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    pub fn run(&mut self, reporter: &mut Reporter) -> Result<Summary> {
        match self.convert(reporter) {
            Ok(summary) => {
                self.transition(State::Done);
                Ok(summary)
            }
            Err(e) => {
                reporter.finish_phase();
                self.abort();
                Err(e)
            }
        }
    }

    fn convert(&mut self, reporter: &mut Reporter) -> Result<Summary> {
        let job = self.job;
        // Adapters are owned here so that an early return drops, and thereby releases, them.
        let mut source = job.source_format.open_read(job.origin)?;
        let info = source.info().clone();
        self.transition(State::SourceOpened);

        let (schema, dropped) = info
            .schema
            .partition(|attribute| job.destination_format.stores(attribute));
        if !dropped.is_empty() {
            reporter.warning(&format!(
                "{} cannot store {}, dropping {}",
                job.destination_format.name().to_uppercase(),
                dropped.iter().join(", "),
                if dropped.len() == 1 { "it" } else { "them" }
            ));
        }

        let mut options = SinkOptions::new(schema.clone());
        options.text_encoding = job.text_encoding;
        options.count = info.count;
        options.bounds = info.bounds;
        options.precision = info.precision;
        let requirements = job.destination_format.requirements();
        if (requirements.bounds && options.bounds.is_none())
            || (requirements.count && options.count.is_none())
        {
            let (count, bounds) = self.scan(reporter, info.count)?;
            options.count = Some(count);
            // An empty cloud still needs a valid header.
            options.bounds = Some(bounds.unwrap_or(Bounds::from_point([0.0; 3])));
        }

        // A sink that fails before creating its file must not cost an existing destination.
        let existed = job.destination.exists();
        let mut sink = match job.destination_format.open_write(job.destination, &options) {
            Ok(sink) => sink,
            Err(e) => {
                self.destination_touched = !existed && job.destination.exists();
                return Err(e);
            }
        };
        self.destination_touched = true;
        self.transition(State::Converting);

        let mut progress = ProgressState::new(Phase::Writing, options.count);
        reporter.start_phase(&progress);
        reporter.update(&progress);
        while let Some(mut chunk) = source.read_chunk()? {
            chunk.restrict_to(&schema);
            sink.write_chunk(&chunk)?;
            progress.processed += chunk.len() as u64;
            progress.estimate = source.progress();
            reporter.update(&progress);
        }
        progress.estimate = source.progress();
        reporter.update(&progress);
        reporter.finish_phase();
        reporter.success(&format!(
            "Read {} points from {}",
            progress.processed,
            job.origin.display()
        ));

        self.transition(State::Finalizing);
        sink.close()?;
        source.close()?;
        Ok(Summary {
            points: progress.processed,
            dropped,
        })
    }

    /// Streams the source once more to learn what the sink needs before it can be opened.
    fn scan(&self, reporter: &mut Reporter, total: Option<u64>) -> Result<(u64, Option<Bounds>)> {
        log::info!(
            "scanning {} for the point count and bounds",
            self.job.origin.display()
        );
        let mut source = self.job.source_format.open_read(self.job.origin)?;
        let mut progress = ProgressState::new(Phase::Reading, total);
        let mut bounds: Option<Bounds> = None;
        reporter.start_phase(&progress);
        while let Some(chunk) = source.read_chunk()? {
            if let Some(chunk_bounds) = chunk.bounds() {
                match bounds.as_mut() {
                    Some(b) => b.merge(&chunk_bounds),
                    None => bounds = Some(chunk_bounds),
                }
            }
            progress.processed += chunk.len() as u64;
            progress.estimate = source.progress();
            reporter.update(&progress);
        }
        progress.estimate = source.progress();
        reporter.update(&progress);
        source.close()?;
        reporter.finish_phase();
        Ok((progress.processed, bounds))
    }

    /// Removes whatever was written to the destination. The adapters are already dropped by
    /// then; a sink that is dropped instead of closed never writes its trailer.
    fn abort(&mut self) {
        self.transition(State::Failed);
        if self.destination_touched && self.job.destination.exists() {
            if let Err(e) = fs::remove_file(self.job.destination) {
                log::warn!(
                    "could not remove partial output {}: {}",
                    self.job.destination.display(),
                    e
                );
            }
        }
    }
}

/// Runs `job` to completion.
pub fn convert(job: &Job, reporter: &mut Reporter) -> Result<Summary> {
    Pipeline::new(job).run(reporter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ConvertError;
    use crate::formats::{Format, PointSink, PointSource};
    use crate::points::CHUNK_SIZE;
    use crate::shared::progress::{Stream, Verbosity};

    /// Reads PTS but refuses every destination before creating it.
    struct Refusing;

    impl PointFormat for Refusing {
        fn name(&self) -> &str {
            "refusing"
        }

        fn stores(&self, _attribute: &Attribute) -> bool {
            true
        }

        fn open_read(&self, path: &Path) -> Result<Box<dyn PointSource>> {
            Format::Pts.open_read(path)
        }

        fn open_write(&self, path: &Path, _options: &SinkOptions) -> Result<Box<dyn PointSink>> {
            Err(ConvertError::destination_format(
                path,
                anyhow::anyhow!("no room for another cloud"),
            ))
        }
    }

    #[test]
    fn successful_run_ends_done() {
        let dir = tempfile::tempdir().unwrap();
        let origin = dir.path().join("in.pts");
        fs::write(&origin, "1 2 3 10\n4 5 6 20\n").unwrap();
        let destination = dir.path().join("out.ply");
        let job = Job {
            origin: &origin,
            source_format: &Format::Pts,
            destination: &destination,
            destination_format: &Format::Ply,
            text_encoding: true,
        };
        let mut pipeline = Pipeline::new(&job);
        assert_eq!(pipeline.state(), State::Idle);
        let summary = pipeline.run(&mut Reporter::new(Verbosity::Silent)).unwrap();
        assert_eq!(pipeline.state(), State::Done);
        assert_eq!(summary.points, 2);
        assert!(summary.dropped.is_empty());
        assert!(fs::read_to_string(&destination)
            .unwrap()
            .contains("property ushort intensity"));
    }

    #[test]
    fn broken_source_ends_failed_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let origin = dir.path().join("in.pts");
        fs::write(&origin, "1 2 3\n4 5 six\n").unwrap();
        let destination = dir.path().join("out.pcd");
        let job = Job {
            origin: &origin,
            source_format: &Format::Pts,
            destination: &destination,
            destination_format: &Format::Pcd,
            text_encoding: false,
        };
        let mut pipeline = Pipeline::new(&job);
        let err = pipeline
            .run(&mut Reporter::new(Verbosity::Silent))
            .unwrap_err();
        assert_eq!(err.exit_code(), 5);
        assert_eq!(pipeline.state(), State::Failed);
        assert!(!destination.exists());
    }

    #[test]
    fn missing_origin_leaves_existing_destination_alone() {
        let dir = tempfile::tempdir().unwrap();
        let origin = dir.path().join("gone.ply");
        let destination = dir.path().join("out.las");
        fs::write(&destination, b"previous").unwrap();
        let job = Job {
            origin: &origin,
            source_format: &Format::Ply,
            destination: &destination,
            destination_format: &Format::Las,
            text_encoding: false,
        };
        let err = convert(&job, &mut Reporter::new(Verbosity::Silent)).unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert_eq!(fs::read(&destination).unwrap(), b"previous");
    }

    #[test]
    fn sink_refused_before_creation_keeps_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let origin = dir.path().join("in.pts");
        fs::write(&origin, "1 2 3\n").unwrap();
        let destination = dir.path().join("out.cloud");
        fs::write(&destination, b"previous").unwrap();
        let job = Job {
            origin: &origin,
            source_format: &Format::Pts,
            destination: &destination,
            destination_format: &Refusing,
            text_encoding: false,
        };
        let mut pipeline = Pipeline::new(&job);
        let err = pipeline
            .run(&mut Reporter::new(Verbosity::Silent))
            .unwrap_err();
        assert_eq!(err.exit_code(), 6);
        assert_eq!(pipeline.state(), State::Failed);
        assert_eq!(fs::read(&destination).unwrap(), b"previous");
    }

    #[test]
    fn unknown_count_still_reports_percentages() {
        let dir = tempfile::tempdir().unwrap();
        let origin = dir.path().join("in.pts");
        let lines: String = (0..3 * CHUNK_SIZE)
            .map(|i| format!("{} {} 0.5\n", i, 2 * i))
            .collect();
        fs::write(&origin, lines).unwrap();
        let destination = dir.path().join("out.ply");
        let job = Job {
            origin: &origin,
            source_format: &Format::Pts,
            destination: &destination,
            destination_format: &Format::Ply,
            text_encoding: false,
        };
        let mut reporter = Reporter::capturing(Verbosity::Machine);
        convert(&job, &mut reporter).unwrap();

        let percentages: Vec<&str> = reporter
            .captured()
            .iter()
            .filter(|(stream, _)| *stream == Stream::Stdout)
            .map(|(_, line)| line.as_str())
            .collect();
        assert!(percentages.len() >= 3, "{:?}", percentages);
        assert!(percentages.iter().all(|line| line.starts_with('w')));
        assert_eq!(percentages.last(), Some(&"w100"));
    }
}
