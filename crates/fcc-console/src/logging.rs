use crate::config::RuntimeConfig;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Keeps the log file open for the lifetime of the process.
pub struct LogGuard {
    file: Option<Arc<StdMutex<File>>>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

/// Tees formatted events to stderr and/or the log file. With neither
/// enabled, events are dropped so the operator prompt stays readable.
struct MultiWriter {
    stderr_enabled: bool,
    file: Option<Arc<StdMutex<File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<StdMutex<File>>>, stderr_enabled: bool) -> Self {
        Self {
            stderr_enabled,
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stderr_enabled {
            let _ = io::stderr().write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stderr_enabled {
            let _ = io::stderr().flush();
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

pub fn init_logging(config: &RuntimeConfig) -> Option<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let guard = match config.log_file.as_deref().map(open_log_file) {
        Some(Ok(file)) => LogGuard {
            file: Some(Arc::new(StdMutex::new(file))),
        },
        Some(Err(err)) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
        None => LogGuard { file: None },
    };
    let file = guard.file.clone();
    let stderr_enabled = config.log_stdout;
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone(), stderr_enabled));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn file_writer_appends_and_creates_parent_dirs() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let path = std::env::temp_dir()
            .join(format!("fcc-console-log-test-{nanos}"))
            .join("nested")
            .join("console.log");
        let file = open_log_file(&path).expect("open");
        let shared = Some(Arc::new(StdMutex::new(file)));

        let mut writer = MultiWriter::new(shared.clone(), false);
        writer.write_all(b"first\n").expect("write");
        let mut writer = MultiWriter::new(shared, false);
        writer.write_all(b"second\n").expect("write");
        writer.flush().expect("flush");

        let written = std::fs::read_to_string(&path).expect("read back");
        assert_eq!(written, "first\nsecond\n");
        if let Some(dir) = path.parent().and_then(Path::parent) {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn disabled_writer_swallows_output() {
        let mut writer = MultiWriter::new(None, false);
        assert_eq!(writer.write(b"dropped").expect("write"), 7);
    }
}
