//! Potree output through the external PotreeConverter executable.

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use crossbeam::channel::{self, Sender};
use walkdir::WalkDir;

use crate::commands::pointcloud::pipeline::{self, Job};
use crate::errors::{ConvertError, Result};
use crate::formats::Format;
use crate::shared::progress::{elapsed_suffix, Phase, ProgressState, Reporter};

pub const CONVERTER_NAME: &str = "PotreeConverter";
/// Output lines kept for the error report of a failed run.
const OUTPUT_TAIL: usize = 20;
/// How deep below a directory the converter executable is searched.
const SEARCH_DEPTH: usize = 4;

fn is_converter(file_name: &OsStr) -> bool {
    let name = file_name.to_string_lossy().to_lowercase();
    name == "potreeconverter" || name == "potreeconverter.exe"
}

fn find_below(directory: &Path) -> Option<PathBuf> {
    WalkDir::new(directory)
        .max_depth(SEARCH_DEPTH)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.file_type().is_file() && is_converter(entry.file_name()))
        .map(|entry| entry.into_path())
}

/// Finds the converter: the configured path (an executable or a directory to search), then
/// anything shipped next to this program, then whatever `PATH` provides.
pub fn locate_converter(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        if path.is_dir() {
            return find_below(path).ok_or_else(|| ConvertError::ExternalTool {
                message: format!("no {} found below '{}'", CONVERTER_NAME, path.display()),
                output: Vec::new(),
            });
        }
        return Err(ConvertError::ExternalTool {
            message: format!("configured converter '{}' does not exist", path.display()),
            output: Vec::new(),
        });
    }
    let bundled = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().and_then(find_below));
    Ok(bundled.unwrap_or_else(|| PathBuf::from(CONVERTER_NAME)))
}

/// First `NN%` marker in a line of converter output.
pub fn parse_progress(line: &str) -> Option<u64> {
    line.match_indices('%').find_map(|(end, _)| {
        let digits = line[..end]
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .count();
        if digits == 0 || digits > 3 {
            return None;
        }
        line[end - digits..end]
            .parse::<u64>()
            .ok()
            .filter(|percent| *percent <= 100)
    })
}

/// Forwards output lines, splitting carriage-return updates into separate lines.
fn forward_lines<R: Read>(stream: R, lines: Sender<String>) {
    for line in BufReader::new(stream).split(b'\n') {
        let Ok(line) = line else {
            break;
        };
        for part in String::from_utf8_lossy(&line).split('\r') {
            let part = part.trim();
            if !part.is_empty() && lines.send(part.to_string()).is_err() {
                return;
            }
        }
    }
}

/// Runs the converter on a LAS file and waits for it, reporting its progress.
pub fn run_converter(
    converter: &Path,
    input: &Path,
    output: &Path,
    reporter: &mut Reporter,
) -> Result<()> {
    log::info!(
        "running {} {} -o {}",
        converter.display(),
        input.display(),
        output.display()
    );
    let mut child = Command::new(converter)
        .arg(input)
        .arg("-o")
        .arg(output)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ConvertError::ExternalTool {
            message: format!("could not launch '{}': {}", converter.display(), e),
            output: Vec::new(),
        })?;

    let (sender, lines) = channel::unbounded();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        let sender = sender.clone();
        readers.push(thread::spawn(move || forward_lines(stdout, sender)));
    }
    if let Some(stderr) = child.stderr.take() {
        let sender = sender.clone();
        readers.push(thread::spawn(move || forward_lines(stderr, sender)));
    }
    drop(sender);

    let mut progress = ProgressState::new(Phase::ExternalConversion, Some(100));
    reporter.start_phase(&progress);
    let mut tail = VecDeque::with_capacity(OUTPUT_TAIL);
    for line in lines {
        log::debug!("{}: {}", CONVERTER_NAME, line);
        if let Some(percent) = parse_progress(&line) {
            progress.processed = percent;
            reporter.update(&progress);
        }
        if tail.len() == OUTPUT_TAIL {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    for reader in readers {
        let _ = reader.join();
    }
    let status = child.wait().map_err(|e| ConvertError::io(converter, e))?;
    reporter.finish_phase();

    if !status.success() {
        return Err(ConvertError::ExternalTool {
            message: format!("{} exited with {}", CONVERTER_NAME, status),
            output: tail.into(),
        });
    }
    progress.processed = 100;
    reporter.update(&progress);
    Ok(())
}

/// Writes `origin` as a Potree directory at `output`. Non-LAS origins are first converted to a
/// temporary LAS file, which is removed whether or not the converter succeeds.
pub fn export(
    origin: &Path,
    origin_format: Format,
    output: &Path,
    converter: Option<&Path>,
    reporter: &mut Reporter,
) -> Result<()> {
    let converter = locate_converter(converter)?;
    log::debug!("using converter {}", converter.display());

    let staging = match origin_format {
        Format::Las | Format::Laz => None,
        _ => Some(tempfile::tempdir().map_err(|e| ConvertError::io(&std::env::temp_dir(), e))?),
    };
    let input = match &staging {
        None => origin.to_path_buf(),
        Some(dir) => {
            let stem = origin.file_stem().unwrap_or(OsStr::new("cloud"));
            let intermediate = dir.path().join(format!("{}.las", stem.to_string_lossy()));
            let started = std::time::Instant::now();
            let job = Job {
                origin,
                source_format: &origin_format,
                destination: &intermediate,
                destination_format: &Format::Las,
                text_encoding: false,
            };
            let summary = pipeline::convert(&job, reporter)?;
            reporter.success(&format!(
                "Prepared {} points for {} {}",
                summary.points,
                CONVERTER_NAME,
                elapsed_suffix(started)
            ));
            intermediate
        }
    };

    run_converter(&converter, &input, output, reporter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::progress::{Stream, Verbosity};

    /// Writes a stand-in converter that records its input path, and whether that file existed,
    /// to `seen.txt` before printing progress and exiting with `status`.
    #[cfg(unix)]
    fn fake_converter(dir: &Path, status: i32) -> (PathBuf, PathBuf) {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("PotreeConverter");
        let seen = dir.join("seen.txt");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$1\" > '{seen}'\n[ -f \"$1\" ] && echo exists >> '{seen}'\n\
                 echo \"[50%, 1s]\"\nmkdir -p \"$3\"\nexit {status}\n",
                seen = seen.display(),
                status = status
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script, seen)
    }

    #[cfg(unix)]
    fn write_pts(dir: &Path) -> PathBuf {
        let origin = dir.join("scan.pts");
        std::fs::write(&origin, "1 2 3\n4 5 6\n").unwrap();
        origin
    }

    #[test]
    fn progress_markers() {
        assert_eq!(parse_progress("[24%, 2s], [INDEXING: 48%, duration: 2s]"), Some(24));
        assert_eq!(parse_progress("INDEXING: 7% done"), Some(7));
        assert_eq!(parse_progress("100%"), Some(100));
        assert_eq!(parse_progress("CPU: 1234%"), None);
        assert_eq!(parse_progress("no markers here"), None);
        assert_eq!(parse_progress("% 50%"), Some(50));
    }

    #[test]
    fn converter_names_match_case_insensitively() {
        assert!(is_converter(OsStr::new("PotreeConverter")));
        assert!(is_converter(OsStr::new("potreeconverter.EXE")));
        assert!(!is_converter(OsStr::new("PotreeConverter.dll")));
    }

    #[test]
    fn configured_directory_is_searched() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("tools/potree/bin");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("PotreeConverter"), b"").unwrap();
        assert_eq!(
            locate_converter(Some(dir.path())).unwrap(),
            nested.join("PotreeConverter")
        );
    }

    #[test]
    fn missing_configured_converter_is_an_external_tool_error() {
        let err = locate_converter(Some(Path::new("/no/such/converter"))).unwrap_err();
        assert_eq!(err.exit_code(), 7);
    }

    #[cfg(unix)]
    #[test]
    fn failing_converter_reports_its_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("PotreeConverter");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"[10%, 1s]\"\necho \"input broken: $1\" >&2\nexit 3\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let input = dir.path().join("cloud.las");
        let err = run_converter(
            &script,
            &input,
            &dir.path().join("out"),
            &mut Reporter::new(Verbosity::Silent),
        )
        .unwrap_err();
        match err {
            ConvertError::ExternalTool { output, .. } => {
                assert!(output.contains(&"[10%, 1s]".to_string()));
                assert!(output
                    .iter()
                    .any(|l| l == &format!("input broken: {}", input.display())));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn text_origin_goes_through_a_removed_intermediate() {
        let dir = tempfile::tempdir().unwrap();
        let (script, seen) = fake_converter(dir.path(), 0);
        let origin = write_pts(dir.path());
        let output = dir.path().join("scan_potree");

        let mut reporter = Reporter::capturing(Verbosity::Machine);
        export(&origin, Format::Pts, &output, Some(&script), &mut reporter).unwrap();

        let seen = std::fs::read_to_string(seen).unwrap();
        let mut lines = seen.lines();
        let input = PathBuf::from(lines.next().unwrap());
        assert_eq!(input.file_name().unwrap(), "scan.las");
        assert_eq!(lines.next(), Some("exists"));
        assert!(!input.exists());
        assert!(output.is_dir());

        let percentages: Vec<&str> = reporter
            .captured()
            .iter()
            .filter(|(stream, line)| *stream == Stream::Stdout && line.starts_with('p'))
            .map(|(_, line)| line.as_str())
            .collect();
        assert_eq!(percentages, ["p50", "p100"]);
    }

    #[cfg(unix)]
    #[test]
    fn intermediate_is_removed_when_the_converter_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (script, seen) = fake_converter(dir.path(), 3);
        let origin = write_pts(dir.path());

        let err = export(
            &origin,
            Format::Pts,
            &dir.path().join("scan_potree"),
            Some(&script),
            &mut Reporter::new(Verbosity::Silent),
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 7);

        let seen = std::fs::read_to_string(seen).unwrap();
        let input = PathBuf::from(seen.lines().next().unwrap());
        assert_eq!(input.extension().unwrap(), "las");
        assert!(!input.exists());
    }

    #[cfg(unix)]
    #[test]
    fn las_origin_is_handed_over_directly() {
        let dir = tempfile::tempdir().unwrap();
        let (script, seen) = fake_converter(dir.path(), 0);
        let origin = dir.path().join("survey.las");
        std::fs::write(&origin, b"only the converter reads this").unwrap();

        export(
            &origin,
            Format::Las,
            &dir.path().join("survey_potree"),
            Some(&script),
            &mut Reporter::new(Verbosity::Silent),
        )
        .unwrap();

        let seen = std::fs::read_to_string(seen).unwrap();
        assert_eq!(seen.lines().next(), Some(origin.to_str().unwrap()));
        assert!(origin.exists());
    }
}
