//! Terminal feedback for provider actions.

use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinHandle;

use crate::provider::operation::ProgressHandle;

const REFRESH: Duration = Duration::from_millis(200);

/// Prints a dimmed status line.
pub fn status(message: &str) {
    eprintln!("[nimbus] {}", message.bright_black());
}

pub fn success(message: &str) {
    eprintln!("[nimbus] {}", message.green());
}

/// Draws a bar that follows `progress` until the operation is finalized.
pub fn follow(progress: ProgressHandle) -> JoinHandle<()> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("         {bar:40.cyan/dim} {pos:>3}%")
            .expect("valid template")
            .progress_chars("━━─"),
    );
    tokio::spawn(async move {
        loop {
            pb.set_position(progress.percentage().into());
            if progress.is_finished() {
                pb.finish();
                break;
            }
            tokio::time::sleep(REFRESH).await;
        }
    })
}

/// Spinner shown while waiting a fixed time for an instance to boot.
pub fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("[nimbus] {spinner:.cyan} {msg} {elapsed}")
            .expect("valid template"),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}
