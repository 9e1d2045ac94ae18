use anyhow::Result;
use chrono::Local;
use log::{Level, LevelFilter, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

// Logging and terminal helpers for the CLI.

/// Level for records from crates other than dugout (reqwest, hyper, ...)
const DEPENDENCY_LEVEL: LevelFilter = LevelFilter::Warn;

/// Writes log records to the log file, or stdout when there is none.
/// Errors are echoed to stderr so they stay visible next to the chat.
pub struct ChatLogger {
    log_file: Option<Mutex<File>>,
    level: LevelFilter,
}

impl ChatLogger {
    pub fn new(log_file_path: Option<&str>, level: LevelFilter) -> Result<Self> {
        let log_file = match log_file_path {
            Some(path) => Some(Mutex::new(OpenOptions::new().create(true).append(true).open(path)?)),
            None => None,
        };

        Ok(ChatLogger { log_file, level })
    }

    fn level_for(&self, target: &str) -> LevelFilter {
        if target == "dugout" || target.starts_with("dugout::") {
            self.level
        } else {
            DEPENDENCY_LEVEL.min(self.level)
        }
    }
}

fn format_record(record: &Record) -> String {
    format!(
        "[{}] {} [{}:{}] {}\n",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        record.level(),
        record.file().unwrap_or("unknown"),
        record.line().unwrap_or(0),
        record.args()
    )
}

impl log::Log for ChatLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level_for(metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_record(record);

        match &self.log_file {
            Some(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = file.write_all(line.as_bytes());
                }
                if record.level() == Level::Error {
                    eprint!("{}", line);
                }
            }
            None => print!("{}", line),
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.log_file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        let _ = std::io::stdout().flush();
    }
}

/// Read a line of input from stdin, trimming whitespace
pub fn read_line() -> Result<String> {
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

pub fn setup_logging(log_file: Option<&str>, level: LevelFilter) -> Result<()> {
    let logger = ChatLogger::new(log_file, level)?;
    log::set_boxed_logger(Box::new(logger)).map(|()| log::set_max_level(level))?;

    log::info!("Logging initialized at level: {}", level);
    log::info!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    Ok(())
}
