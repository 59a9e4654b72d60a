//! Progress reporting module with TTY detection.
//!
//! This module provides progress bar functionality that automatically detects
//! whether stdout is a TTY and falls back to non-interactive output when not.

use std::time::Instant;

use atty::Stream;
use indicatif::{ProgressBar, ProgressStyle};

/// Detects whether stdout is connected to a TTY.
pub fn is_tty() -> bool {
    atty::is(Stream::Stdout)
}

/// Progress reporter that shows progress bars in TTY mode
/// and falls back to simple text output when not in a TTY.
pub struct ProgressReporter {
    /// Whether we're running in TTY mode
    is_tty: bool,
    /// Total number of repositories being synced/built
    total_repos: usize,
    /// Current repository being processed (1-indexed)
    current_repo: usize,
    /// Current repository name
    current_name: String,
    /// Progress bar (only used in TTY mode)
    progress_bar: Option<ProgressBar>,
    /// Start time for calculating elapsed time
    start_time: Instant,
}

impl ProgressReporter {
    /// Creates a new progress reporter.
    ///
    /// # Arguments
    /// * `total_repos` - Total number of repositories to sync/build
    pub fn new(total_repos: usize) -> Self {
        let is_tty = is_tty();
        let progress_bar = if is_tty {
            let pb = ProgressBar::new(total_repos as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        Self {
            is_tty,
            total_repos,
            current_repo: 0,
            current_name: String::new(),
            progress_bar,
            start_time: Instant::now(),
        }
    }

    /// Creates a silent progress reporter that always uses non-TTY mode.
    /// Use this when you explicitly want to disable progress bars regardless of TTY.
    #[allow(dead_code)]
    pub fn silent(total_repos: usize) -> Self {
        Self {
            is_tty: false,
            total_repos,
            current_repo: 0,
            current_name: String::new(),
            progress_bar: None,
            start_time: Instant::now(),
        }
    }

    /// Sets the repository currently being synced.
    ///
    /// # Arguments
    /// * `index` - The 1-indexed position of the repo in the build order
    /// * `name` - The repository's name
    pub fn set_repo(&mut self, index: usize, name: &str) {
        self.current_repo = index;
        self.current_name = name.to_string();

        if self.is_tty {
            if let Some(ref pb) = self.progress_bar {
                let elapsed = self.start_time.elapsed();
                let msg = format!("[{}/{}] Syncing {}... ({elapsed:?})", self.current_repo, self.total_repos, self.current_name);
                pb.set_message(msg);
                pb.set_position((self.current_repo - 1) as u64);
            }
        } else {
            let elapsed = self.start_time.elapsed();
            eprintln!("[{}/{}] Syncing {}... ({elapsed:?})", self.current_repo, self.total_repos, self.current_name);
        }
    }

    /// Marks the current repository's sync/build step as completed.
    pub fn finish_repo(&mut self) {
        if self.is_tty {
            if let Some(ref pb) = self.progress_bar {
                pb.inc(1);
            }
        }
    }

    /// Sets a status message (e.g., "Generating site...").
    #[allow(dead_code)]
    pub fn set_status(&self, status: &str) {
        if self.is_tty {
            if let Some(ref pb) = self.progress_bar {
                let current = pb.position();
                let msg = format!("[{}/{}] {}", current + 1, self.total_repos, status);
                pb.set_message(msg);
            }
        } else {
            eprintln!("[status] {status}");
        }
    }

    /// Finishes the progress reporting.
    pub fn finish(self) {
        let elapsed = self.start_time.elapsed();
        if self.is_tty {
            if let Some(pb) = self.progress_bar {
                let msg = format!("Built {} repositories in {elapsed:?}", self.total_repos);
                pb.set_message(msg);
                pb.finish();
            }
        } else {
            eprintln!("Built {}/{} repositories in {elapsed:?}", self.total_repos, self.total_repos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_tty_returns_bool() {
        let result = is_tty();
        assert!(matches!(result, true | false));
    }

    #[test]
    fn silent_reporter_disables_tty() {
        let reporter = ProgressReporter::silent(3);
        assert!(!reporter.is_tty);
        assert!(reporter.progress_bar.is_none());
    }

    #[test]
    fn set_repo_updates_state() {
        let mut reporter = ProgressReporter::silent(3);
        reporter.set_repo(1, "docs-repo");
        assert_eq!(reporter.current_repo, 1);
        assert_eq!(reporter.current_name, "docs-repo");
    }

    #[test]
    fn finish_repo_is_callable_in_silent_mode() {
        let mut reporter = ProgressReporter::silent(3);
        reporter.set_repo(1, "docs-repo");
        reporter.finish_repo();
    }

    #[test]
    fn finish_completes_without_panic() {
        let reporter = ProgressReporter::silent(3);
        reporter.finish();
    }
}
