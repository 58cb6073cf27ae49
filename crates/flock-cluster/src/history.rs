//! Bounded audit trail of membership changes.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::error;

#[derive(Serialize)]
#[serde(rename = "history")]
struct HistoryXml<'a> {
    event: Vec<&'a str>,
}

/// Keeps the most recent view-change descriptions, oldest dropped first.
pub struct ViewHistory {
    entries: Mutex<VecDeque<String>>,
    max_length: AtomicUsize,
}

impl ViewHistory {
    pub fn new(max_length: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_length.min(1024))),
            max_length: AtomicUsize::new(max_length),
        }
    }

    /// Append an entry stamped with the current time.
    pub fn record(&self, entry: impl AsRef<str>) {
        let max = self.max_length.load(Ordering::Relaxed);
        if max == 0 {
            return;
        }
        let stamped = format!("{} - {}", timestamp_millis(), entry.as_ref());

        let mut entries = self.lock();
        entries.push_back(stamped);
        while entries.len() > max {
            entries.pop_front();
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length.load(Ordering::Relaxed)
    }

    /// Change the bound, trimming the oldest entries if needed.
    pub fn set_max_length(&self, max_length: usize) {
        self.max_length.store(max_length, Ordering::Relaxed);
        let mut entries = self.lock();
        while entries.len() > max_length {
            entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// One entry per line, oldest first.
    pub fn show(&self) -> String {
        let entries = self.lock();
        let mut out = String::new();
        for entry in entries.iter() {
            out.push_str(entry);
            out.push('\n');
        }
        out
    }

    /// The entries as `<event>` elements of a `<history>` element.
    pub fn show_as_xml(&self) -> String {
        let entries = self.lock();
        let xml = HistoryXml {
            event: entries.iter().map(String::as_str).collect(),
        };
        match quick_xml::se::to_string(&xml) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "failed to render history as xml");
                String::from("<history/>")
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
