//! Progress bars driven by `FlashProgress` events.
use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use stickr_core::progress::{FlashProgress, Stage};

const BAR_TEMPLATE: &str =
    "{prefix:13} [{elapsed_precise}] [{bar:40.COLOR/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

fn bar_style(color: &str) -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template(&BAR_TEMPLATE.replace("COLOR", color))?
        .progress_chars("■ "))
}

/// A spinner for work whose total size is not known up front.
pub fn spinner(prefix: &'static str) -> Result<ProgressBar> {
    let style = ProgressStyle::default_spinner()
        .template("{prefix:13} [{elapsed_precise}] {spinner:.blue} {bytes} ({bytes_per_sec}) {msg}")?
        .tick_chars("■□▪▫ ");
    Ok(ProgressBar::new_spinner().with_style(style).with_prefix(prefix))
}

fn prefix(stage: Stage) -> &'static str {
    match stage {
        Stage::WritingImage => "Writing",
        Stage::Verifying => "Verifying",
        Stage::PreparingPartitionTable => "Partitioning",
        Stage::WritingCoreImage => "Core image",
        Stage::WritingSystemImage => "System image",
        Stage::Finalizing => "Finalizing",
    }
}

/// One bar per stage. A new bar starts when the stage changes and the
/// previous one is left finished on screen.
pub struct StageBars {
    write_style: ProgressStyle,
    verify_style: ProgressStyle,
    current: Option<(Stage, ProgressBar)>,
}

impl StageBars {
    pub fn new() -> Result<Self> {
        Ok(StageBars {
            write_style: bar_style("green")?,
            verify_style: bar_style("magenta")?,
            current: None,
        })
    }

    pub fn update(&mut self, progress: &FlashProgress) {
        if self.current.as_ref().map(|(stage, _)| *stage) != Some(progress.stage) {
            if let Some((_, bar)) = self.current.take() {
                bar.finish();
            }
            let style = match progress.stage {
                Stage::Verifying => self.verify_style.clone(),
                _ => self.write_style.clone(),
            };
            let bar = ProgressBar::new(progress.total_bytes)
                .with_style(style)
                .with_prefix(prefix(progress.stage));
            self.current = Some((progress.stage, bar));
        }

        if let Some((_, bar)) = &self.current {
            bar.set_length(progress.total_bytes);
            bar.set_position(progress.bytes_written);
        }
    }

    pub fn finish(&mut self) {
        if let Some((_, bar)) = self.current.take() {
            bar.finish();
        }
    }

    /// Leaves the current bar where it stopped.
    pub fn abandon(&mut self) {
        if let Some((_, bar)) = self.current.take() {
            bar.abandon();
        }
    }
}
