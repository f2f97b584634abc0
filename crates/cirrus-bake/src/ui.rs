//! Console output for the engine's progress stream

use std::sync::Mutex;
use std::time::Duration;

use cirrus_engine::Ui;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

/// [`Ui`] rendering progress lines to the terminal. Waiter ticks collapse
/// into a single spinner instead of flooding the output.
pub struct ConsoleUi {
    spinner: Mutex<Option<ProgressBar>>,
}

impl ConsoleUi {
    pub fn new() -> Self {
        Self {
            spinner: Mutex::new(None),
        }
    }

    fn clear_spinner(&self) {
        if let Some(spinner) = self.spinner.lock().unwrap().take() {
            spinner.finish_and_clear();
        }
    }
}

impl Default for ConsoleUi {
    fn default() -> Self {
        Self::new()
    }
}

impl Ui for ConsoleUi {
    fn say(&self, line: &str) {
        self.clear_spinner();
        if line.is_empty() {
            println!();
        } else {
            println!("{} {line}", style("*").cyan());
        }
    }

    fn error(&self, line: &str) {
        self.clear_spinner();
        eprintln!("{} {}", style("x").red(), style(line).red());
    }

    fn tick(&self) {
        let mut guard = self.spinner.lock().unwrap();
        match guard.as_ref() {
            Some(spinner) => spinner.tick(),
            None => {
                let spinner = ProgressBar::new_spinner();
                spinner.set_style(
                    ProgressStyle::default_spinner()
                        .template("{spinner:.cyan} {msg}")
                        .unwrap(),
                );
                spinner.set_message("waiting...");
                spinner.enable_steady_tick(Duration::from_millis(100));
                *guard = Some(spinner);
            }
        }
    }
}
