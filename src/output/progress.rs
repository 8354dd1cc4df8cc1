use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::styling::{bright, bright_green, bright_yellow};

/// Progress of a batch of independent translations
pub struct BatchProgress {
    pb: ProgressBar,
}

impl BatchProgress {
    pub fn start(total: usize) -> Self {
        eprintln!("{}  {}", bright("⚙️"), bright("Translating").underlined());
        let pb = create_bar(total as u64);
        pb.set_message(bright_yellow(format!("0/{total} pipelines")).to_string());
        Self { pb }
    }

    /// Hidden progress for tests and non-interactive runs.
    pub fn hidden() -> Self {
        Self {
            pb: ProgressBar::hidden(),
        }
    }

    pub fn advance(&self, file: &str) {
        self.pb.inc(1);
        let done = self.pb.position();
        let total = self.pb.length().unwrap_or(done);
        self.pb
            .set_message(bright_yellow(format!("{done}/{total} pipelines, last: {file}")).to_string());
    }

    pub fn finish(self) {
        let total = self.pb.length().unwrap_or_default();
        self.pb
            .finish_with_message(bright_green(format!("{total} pipelines translated ✓")).to_string());
        eprintln!();
    }
}

fn create_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_draw_target(ProgressDrawTarget::stderr());
    let style = ProgressStyle::default_bar()
        .template("  {bar:30.cyan/blue} {msg} {spinner}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}
