use std::io::{stderr, IsTerminal};
use std::sync::Arc;

use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::worker::ProgressTracker;

const BAR_TEMPLATE: &str = "{prefix} [{bar:40}] {pos:>5}/{len:<5} | {percent:>3}% | {elapsed_precise}<{eta_precise} | {msg}";
const SPINNER_TEMPLATE: &str = "{prefix} {spinner} {elapsed_precise} | {msg}";

fn ellipsize(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut shortened: String = input.chars().take(keep).collect();
    shortened.push_str("...");
    shortened
}

/// Renders a `ProgressTracker`'s snapshot to a terminal bar when stderr is a
/// TTY, and to periodic plain-text lines otherwise (the non-interactive path
/// used by CI logs and the `progress` CLI subcommand piped to a file).
pub struct ProgressReporter {
    bar: Option<ProgressBar>,
    interactive: bool,
}

impl ProgressReporter {
    pub fn new(job_name: &str) -> Self {
        let interactive = stderr().is_terminal();
        let bar = if interactive {
            let bar = ProgressBar::new(0);
            bar.set_draw_target(ProgressDrawTarget::stderr());
            bar.set_style(
                ProgressStyle::with_template(BAR_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar.set_prefix(job_name.to_string());
            Some(bar)
        } else {
            None
        };
        Self { bar, interactive }
    }

    fn spinner_style() -> ProgressStyle {
        ProgressStyle::with_template(SPINNER_TEMPLATE).unwrap_or_else(|_| ProgressStyle::default_spinner())
    }

    /// Renders one tick of `tracker`'s current snapshot.
    pub fn render(&self, tracker: &Arc<ProgressTracker>) {
        let snapshot = tracker.snapshot();
        let message = snapshot
            .current_files
            .first()
            .map(|p| ellipsize(p, 40))
            .unwrap_or_default();

        match (&self.bar, snapshot.know_total) {
            (Some(bar), true) => {
                bar.set_length(snapshot.total_files.unwrap_or(0) as u64);
                bar.set_position(snapshot.files_so_far as u64);
                bar.set_message(format!(
                    "{} / {}",
                    HumanBytes(snapshot.bytes_so_far),
                    HumanBytes(snapshot.total_bytes.unwrap_or(0)),
                ));
            }
            (Some(bar), false) => {
                bar.set_style(Self::spinner_style());
                bar.set_message(format!("{message} ({} files)", snapshot.files_so_far));
            }
            (None, _) => {
                eprintln!(
                    "[{}] {}/{} files, {} bytes, {}",
                    snapshot.job_name,
                    snapshot.files_so_far,
                    snapshot
                        .total_files
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "?".into()),
                    snapshot.bytes_so_far,
                    message,
                );
            }
        }
    }

    pub fn finish(&self, terminal_message: &str) {
        if let Some(bar) = &self.bar {
            bar.finish_with_message(terminal_message.to_string());
        } else if self.interactive {
            eprintln!("{terminal_message}");
        } else {
            eprintln!("{terminal_message}");
        }
    }
}
