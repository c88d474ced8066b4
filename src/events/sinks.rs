use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::info;

use super::fanout::EventSink;
use super::types::SessionEvent;
use crate::configuration::types::{SinkConfig, SinkKind};
use crate::error_handling::types::SinkError;

/// Builds a sink from its configuration entry.
pub fn build(config: &SinkConfig) -> Result<Arc<dyn EventSink>, SinkError> {
    match &config.kind {
        SinkKind::Log => Ok(Arc::new(LogSink::new(&config.name))),
        SinkKind::JsonFile { path } => {
            Ok(Arc::new(JsonFileSink::open(&config.name, path)?))
        }
    }
}

/// Mirrors event summaries into the operational log. Summaries are
/// redacted by construction; secret material never reaches this sink.
pub struct LogSink {
    name: String,
}

impl LogSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl EventSink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, event: &SessionEvent) -> Result<(), SinkError> {
        info!("[{}] {}", event.session_id, event.summary());
        Ok(())
    }
}

/// Appends each event as one JSON line. This is event storage: the full
/// payload, credentials included, lands here.
pub struct JsonFileSink {
    name: String,
    file: Mutex<File>,
}

impl JsonFileSink {
    pub fn open(name: &str, path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| SinkError::Unavailable(e.to_string()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl EventSink for JsonFileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, event: &SessionEvent) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(event)
            .map_err(|e| SinkError::SerializationFailed(e.to_string()))?;
        line.push(b'\n');
        let mut file = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        file.write_all(&line)
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        Ok(())
    }
}
