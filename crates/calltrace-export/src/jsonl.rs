//! JSONL file sink

use calltrace_core::config::JsonlSettings;
use calltrace_core::events::TrackedEvent;
use calltrace_core::sink::{EventSink, SinkError, SinkResult};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{error, info};

/// JSONL sink configuration
#[derive(Debug, Clone)]
pub struct JsonlSinkConfig {
    /// Output file path
    pub path: PathBuf,

    /// Whether to append to existing file
    pub append: bool,

    /// Flush after each write
    pub flush_each: bool,
}

impl Default for JsonlSinkConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("calltrace-events.jsonl"),
            append: true,
            flush_each: true,
        }
    }
}

impl From<&JsonlSettings> for JsonlSinkConfig {
    fn from(settings: &JsonlSettings) -> Self {
        Self {
            path: PathBuf::from(&settings.path),
            append: settings.append,
            flush_each: settings.flush_each,
        }
    }
}

/// Writes one JSON object per line
pub struct JsonlSink {
    config: JsonlSinkConfig,
    writer: Mutex<BufWriter<File>>,
    events_written: AtomicU64,
    write_errors: AtomicU64,
}

impl JsonlSink {
    /// Open (or create) the output file
    pub fn open(config: JsonlSinkConfig) -> SinkResult<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = if config.append {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.path)?
        } else {
            File::create(&config.path)?
        };

        info!("JSONL sink writing to: {:?}", config.path);
        Ok(Self {
            config,
            writer: Mutex::new(BufWriter::new(file)),
            events_written: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn events_written(&self) -> u64 {
        self.events_written.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    fn write_event(&self, event: &TrackedEvent) -> SinkResult<()> {
        let json = serde_json::to_string(event)?;

        let mut w = self.writer.lock().map_err(|_| SinkError::Closed)?;
        writeln!(w, "{}", json)?;
        if self.config.flush_each {
            w.flush()?;
        }

        self.events_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl EventSink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn track(&self, event: TrackedEvent) {
        if let Err(e) = self.write_event(&event) {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
            error!("Failed to write event {} to {:?}: {}", event.name, self.config.path, e);
        }
    }

    fn flush(&self) -> SinkResult<()> {
        let mut w = self.writer.lock().map_err(|_| SinkError::Closed)?;
        w.flush()?;
        Ok(())
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        if let Ok(w) = self.writer.get_mut() {
            let _ = w.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_writes_one_event_per_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = JsonlSink::open(JsonlSinkConfig {
            path: path.clone(),
            ..Default::default()
        })
        .unwrap();

        sink.track(TrackedEvent::new("api_call_start").with("url", "/api/products"));
        sink.track(TrackedEvent::new("api_call_complete").with("duration_ms", 1.5));

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["name"], "api_call_start");
        assert_eq!(lines[0]["attributes"]["url"], "/api/products");
        assert_eq!(lines[1]["attributes"]["duration_ms"], 1.5);
        assert_eq!(sink.events_written(), 2);
    }

    #[test]
    fn test_append_and_truncate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(&path, "{\"name\":\"old\"}\n").unwrap();

        let appending = JsonlSink::open(JsonlSinkConfig {
            path: path.clone(),
            append: true,
            flush_each: true,
        })
        .unwrap();
        appending.track(TrackedEvent::new("new"));
        drop(appending);
        assert_eq!(read_lines(&path).len(), 2);

        let truncating = JsonlSink::open(JsonlSinkConfig {
            path: path.clone(),
            append: false,
            flush_each: true,
        })
        .unwrap();
        truncating.track(TrackedEvent::new("fresh"));
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["name"], "fresh");
    }

    #[test]
    fn test_buffered_until_flush() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("events.jsonl");
        let sink = JsonlSink::open(JsonlSinkConfig {
            path: path.clone(),
            append: true,
            flush_each: false,
        })
        .unwrap();

        sink.track(TrackedEvent::new("search"));
        assert!(std::fs::read_to_string(&path).unwrap().is_empty());

        sink.flush().unwrap();
        assert_eq!(read_lines(&path).len(), 1);
    }

    #[test]
    fn test_config_from_settings() {
        let settings = JsonlSettings {
            enabled: true,
            path: "/tmp/out.jsonl".to_string(),
            append: false,
            flush_each: false,
        };
        let config = JsonlSinkConfig::from(&settings);
        assert_eq!(config.path, PathBuf::from("/tmp/out.jsonl"));
        assert!(!config.append);
        assert!(!config.flush_each);
    }
}
