//! Plain-text, newline-delimited event log independent of the SQLite
//! journal. One line per action or event, format:
//! `YYYY-MM-DD HH:MM:SS [<ACTION>] <16-hex-or-dash> <free-text>`.
//! CR/LF are stripped from both the tag and the free text — a basic
//! log-injection defence since both may be attacker-influenced.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;

use crate::error::Result;

pub struct EventLog {
    path: PathBuf,
    lock: Mutex<()>,
}

fn sanitize(s: &str) -> String {
    s.chars().filter(|c| *c != '\n' && *c != '\r').collect()
}

impl EventLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn append(&self, action: &str, node_tag: Option<&str>, free_text: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let tag = node_tag.map(sanitize).unwrap_or_else(|| "-".to_string());
        let line = format!(
            "{} [{}] {} {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            sanitize(action),
            tag,
            sanitize(free_text),
        );
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}
