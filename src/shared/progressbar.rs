use indicatif::ProgressStyle;

static BAR_TEMPLATE: &str =
    "{spinner:.green} [{bar:40.cyan/blue}] {pos:>7}/{len:7} {msg} [Elapsed: {elapsed_precise}] | [ETA: {eta_precise}]";
static SPINNER_TEMPLATE: &str = "{spinner:.green} {pos:>7} {msg} [Elapsed: {elapsed_precise}]";
static BAR_CHARS: &str = "=> ";

/// Bar for a phase with a known total.
pub fn get_progress_bar(task: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(&format!("{} {}", task, BAR_TEMPLATE))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars(BAR_CHARS)
}

/// Spinner for a phase whose total is unknown.
pub fn get_spinner(task: &str) -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template(&format!("{} {}", task, SPINNER_TEMPLATE))
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}
