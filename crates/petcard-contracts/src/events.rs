use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventFields = Map<String, Value>;

/// Fresh run identifier for one pipeline invocation.
pub fn new_run_id() -> String {
    format!("run-{}", uuid::Uuid::new_v4().simple())
}

/// Append-only `events.jsonl` log, one compact JSON object per line.
///
/// Every record carries `event`, `run_id`, `seq`, and `ts`; caller fields are
/// merged last and may override the defaults. Cheap to clone and safe to
/// share across threads.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    path: PathBuf,
    run_id: String,
    seq: AtomicU64,
    append: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                path: path.into(),
                run_id: run_id.into(),
                seq: AtomicU64::new(0),
                append: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event: &str, fields: EventFields) -> anyhow::Result<Value> {
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        let mut record = Map::new();
        record.insert("event".to_string(), Value::String(event.to_string()));
        record.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        record.insert("seq".to_string(), Value::Number(seq.into()));
        record.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)),
        );
        for (key, value) in fields {
            record.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(&record)?;

        let _guard = self
            .inner
            .append
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(record))
    }
}
