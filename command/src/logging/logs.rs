use std::{
    cmp,
    env,
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::Path,
    sync::Mutex,
};

use log::{Level, LevelFilter, Log, Metadata, Record};
use time::OffsetDateTime;

use crate::logging::LogError;

/// one `target=level` element of a logging spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDirective {
    /// module path prefix, `None` applies to every target
    pub name: Option<String>,
    pub level: LevelFilter,
}

/// parse `info,tandem_lib::reactor=trace,mio=off`
pub fn parse_logging_spec(spec: &str) -> Result<Vec<LogDirective>, LogError> {
    let mut directives = Vec::new();

    for part in spec.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        let mut elements = part.split('=');
        let first = elements.next().unwrap_or_default().trim();
        let second = elements.next().map(str::trim);
        if elements.next().is_some() {
            return Err(LogError::InvalidDirective(
                part.to_owned(),
                "too many '=' in directive",
            ));
        }

        let directive = match second {
            None => match first.parse::<LevelFilter>() {
                Ok(level) => LogDirective { name: None, level },
                // a bare module name enables everything for it
                Err(_) => LogDirective {
                    name: Some(first.to_owned()),
                    level: LevelFilter::Trace,
                },
            },
            Some(level) => {
                let level = level.parse::<LevelFilter>().map_err(|_| {
                    LogError::InvalidDirective(part.to_owned(), "unknown log level")
                })?;
                LogDirective {
                    name: Some(first.to_owned()),
                    level,
                }
            }
        };
        directives.push(directive);
    }

    // most specific directives are matched first
    directives.sort_by_key(|directive| {
        cmp::Reverse(directive.name.as_ref().map(String::len).unwrap_or(0))
    });
    Ok(directives)
}

pub enum LoggerBackend {
    Stdout,
    Stderr,
    File(Mutex<BufWriter<File>>),
}

impl LoggerBackend {
    /// `stdout`, `stderr` or `file:///absolute/path`
    pub fn from_target(target: &str) -> Result<Self, LogError> {
        match target {
            "stdout" => Ok(LoggerBackend::Stdout),
            "stderr" => Ok(LoggerBackend::Stderr),
            target => match target.strip_prefix("file://") {
                Some(path) if !path.is_empty() => {
                    let file = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(Path::new(path))
                        .map_err(|e| LogError::OpenFile(path.to_owned(), e))?;
                    Ok(LoggerBackend::File(Mutex::new(BufWriter::new(file))))
                }
                Some(_) => Err(LogError::InvalidLogTarget(
                    target.to_owned(),
                    "file target without a path",
                )),
                None => Err(LogError::InvalidLogTarget(
                    target.to_owned(),
                    "expected stdout, stderr or file://",
                )),
            },
        }
    }

    fn write_line(&self, line: &str) -> io::Result<()> {
        match self {
            LoggerBackend::Stdout => io::stdout().lock().write_all(line.as_bytes()),
            LoggerBackend::Stderr => io::stderr().lock().write_all(line.as_bytes()),
            LoggerBackend::File(file) => match file.lock() {
                Ok(mut file) => file.write_all(line.as_bytes()),
                Err(_) => Ok(()),
            },
        }
    }

    fn flush(&self) {
        let _ = match self {
            LoggerBackend::Stdout => io::stdout().flush(),
            LoggerBackend::Stderr => io::stderr().flush(),
            LoggerBackend::File(file) => match file.lock() {
                Ok(mut file) => file.flush(),
                Err(_) => Ok(()),
            },
        };
    }
}

pub struct Logger {
    directives: Vec<LogDirective>,
    backend: LoggerBackend,
    colored: bool,
    tag: String,
    pid: u32,
}

impl Logger {
    pub fn new(
        directives: Vec<LogDirective>,
        backend: LoggerBackend,
        colored: bool,
        tag: impl Into<String>,
    ) -> Self {
        Logger {
            directives,
            backend,
            colored,
            tag: tag.into(),
            pid: std::process::id(),
        }
    }

    /// highest level any directive lets through
    pub fn max_level(&self) -> LevelFilter {
        self.directives
            .iter()
            .map(|directive| directive.level)
            .max()
            .unwrap_or(LevelFilter::Error)
    }

    fn level_for(&self, target: &str) -> LevelFilter {
        for directive in &self.directives {
            match &directive.name {
                Some(name) if target.starts_with(name.as_str()) => return directive.level,
                Some(_) => {}
                None => return directive.level,
            }
        }
        LevelFilter::Off
    }

    pub fn format(&self, record: &Record) -> String {
        let now = OffsetDateTime::now_utc();
        let (start, end) = if self.colored {
            (level_color(record.level()), "\x1b[0m")
        } else {
            ("", "")
        };
        format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}Z {} {} {start}{:<5}{end} {}\t{}\n",
            now.year(),
            u8::from(now.month()),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            now.microsecond(),
            self.pid,
            self.tag,
            record.level(),
            record.target(),
            record.args(),
        )
    }
}

fn level_color(level: Level) -> &'static str {
    match level {
        Level::Error => "\x1b[1;31m",
        Level::Warn => "\x1b[1;33m",
        Level::Info => "\x1b[1;37m",
        Level::Debug => "\x1b[1;36m",
        Level::Trace => "\x1b[1;35m",
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level_for(metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = self.format(record);
        // nowhere left to report a failing log sink
        let _ = self.backend.write_line(&line);
    }

    fn flush(&self) {
        self.backend.flush();
    }
}

/// Install the global logger.
///
/// `RUST_LOG`, when set, takes precedence over `spec`.
pub fn setup_logging(target: &str, spec: &str, colored: bool, tag: &str) -> Result<(), LogError> {
    let spec = env::var("RUST_LOG").unwrap_or_else(|_| spec.to_owned());
    let directives = parse_logging_spec(&spec)?;
    let backend = LoggerBackend::from_target(target)?;
    let logger = Logger::new(directives, backend, colored, tag);
    let max_level = logger.max_level();

    log::set_boxed_logger(Box::new(logger)).map_err(|_| LogError::AlreadyInstalled)?;
    log::set_max_level(max_level);
    Ok(())
}

/// stdout logger, a second installation is silently ignored
pub fn setup_default_logging(colored: bool, spec: &str, tag: &str) {
    match setup_logging("stdout", spec, colored, tag) {
        Ok(()) | Err(LogError::AlreadyInstalled) => {}
        Err(e) => eprintln!("could not set up logging: {e}"),
    }
}

#[macro_export]
macro_rules! setup_test_logger {
    () => {
        $crate::logging::setup_default_logging(false, "error", "TEST");
    };
}
