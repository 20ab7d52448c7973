use crate::sandbox::generate_id;
use anyhow::{Context, Result, anyhow};
use colored::Colorize;
use log::{LevelFilter, Log, Metadata, Record};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LevelFilter,
    pub dir: PathBuf,
    pub console: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            dir: PathBuf::from("/var/log/warden"),
            console: true,
        }
    }
}

/**
 * Logger for one launcher run: colored human-readable lines on stderr plus
 * an append-only JSON-lines file at `<dir>/sandbox-<id>.log`. The file is
 * retained after the sandbox exits.
 */
pub struct SandboxLogger {
    level: LevelFilter,
    console: bool,
    file: Mutex<File>,
    id: String,
}

impl SandboxLogger {
    pub fn new(config: &LogConfig) -> Result<&'static Self> {
        let id = generate_id();

        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true).mode(0o755);
        builder.create(&config.dir).context(format!(
            "failed to create log directory {}",
            config.dir.display()
        ))?;

        let path = config.dir.join(format!("sandbox-{}.log", id));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o644)
            .open(&path)
            .context(format!("failed to open log file {}", path.display()))?;

        Ok(Box::leak(Box::new(Self {
            level: config.level,
            console: config.console,
            file: Mutex::new(file),
            id,
        })))
    }

    pub fn init(&'static self) -> Result<&'static Self> {
        log::set_logger(self)
            .map_err(|e| anyhow!("Failed to set logger: {}", e))?;
        log::set_max_level(self.level);
        Ok(self)
    }

    #[allow(dead_code)]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Log for SandboxLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if self.console {
            let color = match record.level() {
                log::Level::Error => colored::Color::Red,
                log::Level::Warn => colored::Color::Yellow,
                log::Level::Info => colored::Color::White,
                log::Level::Debug => colored::Color::Blue,
                log::Level::Trace => colored::Color::BrightBlack,
            };
            let line = format!(
                "[{}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            )
            .color(color);
            let _ = writeln!(io::stderr(), "{}", line);
        }

        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let entry = serde_json::json!({
            "ts": ts,
            "level": record.level().to_string().to_lowercase(),
            "target": record.target(),
            "msg": record.args().to_string(),
            "sandbox_id": self.id,
        });
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{}", entry);
        }
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

/**
 * JSON record shared between the child init process and the parent-side
 * log pipe reader.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitLogEntry {
    pub level: String,
    pub msg: String,
}

/**
 * Reads newline-delimited JSON log records from the read end of the log
 * pipe and re-emits them through the logger with target `init`. Blocks
 * until EOF, which arrives once the child (and anything that inherited the
 * descriptor) has closed the write end.
 */
pub fn read_log_pipe(r: impl Read) {
    let reader = BufReader::new(r);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => return,
        };
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<InitLogEntry>(&line) {
            Ok(entry) => match entry.level.as_str() {
                "debug" => log::debug!(target: "init", "{}", entry.msg),
                "info" => log::info!(target: "init", "{}", entry.msg),
                "warn" => log::warn!(target: "init", "{}", entry.msg),
                "error" => log::error!(target: "init", "{}", entry.msg),
                _ => log::info!(target: "init", "{}", entry.msg),
            },
            /* Malformed lines are surfaced with their raw bytes; they must
             * never stop the reader. */
            Err(_) => {
                log::warn!(target: "init", "unparseable init log: {}", line)
            }
        }
    }
}

/**
 * Writes one log record to the log pipe. Used by the child init process,
 * which has no logger of its own. A broken pipe must never abort init, so
 * write errors are swallowed.
 */
pub fn write_init_log(w: &mut dyn Write, level: &str, msg: &str) {
    let entry = InitLogEntry {
        level: level.to_string(),
        msg: msg.to_string(),
    };
    if let Ok(line) = serde_json::to_string(&entry) {
        let _ = writeln!(w, "{}", line);
    }
}
