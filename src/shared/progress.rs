//! User facing output. The pipeline and the Potree supervisor own a [`ProgressState`] and hand
//! snapshots of it to a [`Reporter`], which decides what to print for the configured level.

use std::time::Instant;

use colored::Colorize;
use indicatif::ProgressBar;

use crate::errors::ConvertError;
use crate::shared::progressbar::{get_progress_bar, get_spinner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Silent,
    /// Plain milestone lines.
    Milestones,
    /// Colored milestones plus progress bars.
    Rich,
    /// Raw percentages for another process to parse.
    Machine,
}

impl Verbosity {
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Verbosity::Silent,
            1 => Verbosity::Milestones,
            2 => Verbosity::Rich,
            _ => Verbosity::Machine,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Streaming the source without writing, to learn its count or bounds.
    Reading,
    Writing,
    /// PotreeConverter is running.
    ExternalConversion,
}

impl Phase {
    fn code(self) -> char {
        match self {
            Phase::Reading => 'r',
            Phase::Writing => 'w',
            Phase::ExternalConversion => 'p',
        }
    }

    fn label(self) -> &'static str {
        match self {
            Phase::Reading => "Reading",
            Phase::Writing => "Writing",
            Phase::ExternalConversion => "Potree",
        }
    }
}

/// Counters of the running phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressState {
    pub phase: Phase,
    pub processed: u64,
    pub total: Option<u64>,
    /// `(done, total)` in source specific units, used while the point total is unknown.
    pub estimate: Option<(u64, u64)>,
}

fn ratio(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.min(total) * 100 / total) as u8
}

impl ProgressState {
    pub fn new(phase: Phase, total: Option<u64>) -> Self {
        ProgressState {
            phase,
            processed: 0,
            total,
            estimate: None,
        }
    }

    /// Whole percentage done, from the point total or else from the source's own estimate.
    pub fn percent(&self) -> Option<u8> {
        match (self.total, self.estimate) {
            (Some(total), _) => Some(ratio(self.processed, total)),
            (None, Some((done, total))) => Some(ratio(done, total)),
            (None, None) => None,
        }
    }
}

/// Formats the time since `started` as a milestone suffix.
pub fn elapsed_suffix(started: Instant) -> String {
    format!("[{:.3}s]", started.elapsed().as_secs_f64())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notice {
    Success,
    Warning,
}

pub struct Reporter {
    verbosity: Verbosity,
    bar: Option<ProgressBar>,
    last_percent: Option<(Phase, u8)>,
    /// Collects output instead of printing it.
    captured: Option<Vec<(Stream, String)>>,
}

impl Reporter {
    pub fn new(verbosity: Verbosity) -> Self {
        Reporter {
            verbosity,
            bar: None,
            last_percent: None,
            captured: None,
        }
    }

    /// A reporter that keeps every line it would print, for inspection through
    /// [`Reporter::captured`]. Progress bars are never drawn.
    pub fn capturing(verbosity: Verbosity) -> Self {
        Reporter {
            captured: Some(Vec::new()),
            ..Reporter::new(verbosity)
        }
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    pub fn captured(&self) -> &[(Stream, String)] {
        self.captured.as_deref().unwrap_or_default()
    }

    fn emit(&mut self, stream: Stream, line: String) {
        match (&mut self.captured, stream, &self.bar) {
            (Some(captured), _, _) => captured.push((stream, line)),
            (None, Stream::Stderr, _) => eprintln!("{}", line),
            (None, Stream::Stdout, Some(bar)) => bar.println(line),
            (None, Stream::Stdout, None) => println!("{}", line),
        }
    }

    fn notice(&mut self, kind: Notice, message: &str) {
        let (stream, line) = match (self.verbosity, kind) {
            (Verbosity::Silent, _) => return,
            (Verbosity::Milestones, _) => (Stream::Stdout, message.to_string()),
            (Verbosity::Rich, Notice::Success) => {
                (Stream::Stdout, format!("{}: {}", "SUCCESS".green(), message))
            }
            (Verbosity::Rich, Notice::Warning) => {
                (Stream::Stdout, format!("{}: {}", "WARNING".yellow(), message))
            }
            // Stdout carries nothing but percentages at level 3.
            (Verbosity::Machine, Notice::Success) => return,
            (Verbosity::Machine, Notice::Warning) => {
                (Stream::Stderr, format!("WARNING: {}", message))
            }
        };
        self.emit(stream, line);
    }

    pub fn success(&mut self, message: &str) {
        self.notice(Notice::Success, message);
    }

    /// Expected degradations, such as dropped attributes or an ignored extension.
    pub fn warning(&mut self, message: &str) {
        self.notice(Notice::Warning, message);
    }

    /// Prints the error with its cause chain. Silent runs only report through the exit code.
    pub fn error(&mut self, error: &ConvertError) {
        self.finish_phase();
        if self.verbosity == Verbosity::Silent {
            return;
        }
        let headline = if self.verbosity == Verbosity::Rich {
            format!("{}: {}", "ERROR".red(), error)
        } else {
            format!("ERROR: {}", error)
        };
        self.emit(Stream::Stderr, headline);
        let causes = std::iter::successors(std::error::Error::source(error), |e| e.source());
        for (i, cause) in causes.enumerate() {
            self.emit(Stream::Stderr, format!("  Cause {}: {}", i, cause));
        }
        if let ConvertError::ExternalTool { output, .. } = error {
            for line in output {
                self.emit(Stream::Stderr, format!("  | {}", line));
            }
        }
    }

    /// Starts tracking a phase. Level 2 draws a bar while writing or running PotreeConverter.
    pub fn start_phase(&mut self, state: &ProgressState) {
        self.finish_phase();
        self.last_percent = None;
        if self.verbosity != Verbosity::Rich
            || state.phase == Phase::Reading
            || self.captured.is_some()
        {
            return;
        }
        let label = state.phase.label();
        let bar = match state.total {
            Some(total) => ProgressBar::new(total).with_style(get_progress_bar(label)),
            None => ProgressBar::new_spinner().with_style(get_spinner(label)),
        };
        bar.set_position(state.processed);
        self.bar = Some(bar);
    }

    pub fn update(&mut self, state: &ProgressState) {
        match self.verbosity {
            Verbosity::Rich => {
                if let Some(bar) = &self.bar {
                    bar.set_position(state.processed);
                }
            }
            Verbosity::Machine => {
                if let Some(line) = self.machine_line(state) {
                    self.emit(Stream::Stdout, line);
                }
            }
            Verbosity::Silent | Verbosity::Milestones => {}
        }
    }

    pub fn finish_phase(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }

    /// The `r42` style line for `state`, only when its whole percentage changed.
    fn machine_line(&mut self, state: &ProgressState) -> Option<String> {
        let percent = state.percent()?;
        if self.last_percent == Some((state.phase, percent)) {
            return None;
        }
        self.last_percent = Some((state.phase, percent));
        Some(format!("{}{}", state.phase.code(), percent))
    }
}
