//! HAR archive: append-only recorder and per-key replay queues

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::exchange::{Request, Response};
use crate::{InterposeError, Result};

use super::format::{HarDocument, HarEntry, HarLog};
use super::key::RequestKey;

/// Archive operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HarMode {
    /// Let exchanges reach the network and append them to the archive
    Record,
    /// Serve exchanges from the archive
    Replay,
}

/// Replay behavior when no entry matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotFound {
    /// Abort with `no-matching-har-entry`
    #[default]
    Abort,
    /// Continue to older handlers or the network
    Fallback,
}

/// Archive options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarOptions {
    /// Record or replay
    pub mode: HarMode,
    /// Replay miss behavior
    pub not_found: NotFound,
    /// Glob (or `re:` regex) limiting which URLs touch the archive
    pub url_filter: Option<String>,
    /// Restart exhausted key queues instead of missing
    pub loop_entries: bool,
}

impl Default for HarOptions {
    fn default() -> Self {
        Self {
            mode: HarMode::Replay,
            not_found: NotFound::Abort,
            url_filter: None,
            loop_entries: false,
        }
    }
}

/// Archive counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HarStats {
    /// Entries loaded for replay or recorded so far
    pub entries: usize,
    /// Replay lookups served from the archive
    pub hits: usize,
    /// Replay lookups with no remaining entry
    pub misses: usize,
}

#[derive(Debug)]
struct KeyQueue {
    indices: Vec<usize>,
    cursor: usize,
}

/// HAR archive shared by every exchange routed to it
///
/// Replay entries are immutable after load; only the per-key cursors move.
/// Recorded entries are appended under a short lock.
#[derive(Debug)]
pub struct HarArchive {
    options: HarOptions,
    entries: Vec<HarEntry>,
    queues: DashMap<RequestKey, KeyQueue>,
    recorded: Mutex<Vec<HarEntry>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl HarArchive {
    /// Open an archive
    ///
    /// Replay mode reads and indexes `path`; record mode starts empty.
    ///
    /// # Errors
    ///
    /// Returns error if a replay file cannot be read or parsed
    pub fn open(path: &Path, options: HarOptions) -> Result<Self> {
        match options.mode {
            HarMode::Record => Ok(Self::recorder(options)),
            HarMode::Replay => {
                let document = read_document(path)?;
                let archive = Self::from_document(document, options)?;
                info!(
                    "Loaded HAR archive {} ({} entries, {} keys)",
                    path.display(),
                    archive.entries.len(),
                    archive.queues.len()
                );
                Ok(archive)
            }
        }
    }

    /// Empty archive
    #[must_use]
    pub fn recorder(options: HarOptions) -> Self {
        Self {
            options,
            entries: Vec::new(),
            queues: DashMap::new(),
            recorded: Mutex::new(Vec::new()),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Index an already parsed document
    ///
    /// # Errors
    ///
    /// Returns error if an entry carries a malformed body
    pub fn from_document(document: HarDocument, options: HarOptions) -> Result<Self> {
        let archive = Self {
            entries: document.log.entries,
            ..Self::recorder(options)
        };

        for (index, entry) in archive.entries.iter().enumerate() {
            let key = RequestKey::new(
                &entry.request.method,
                &entry.request.url,
                &entry.request_body()?,
            );
            archive
                .queues
                .entry(key)
                .or_insert_with(|| KeyQueue {
                    indices: Vec::new(),
                    cursor: 0,
                })
                .indices
                .push(index);
        }

        Ok(archive)
    }

    /// Options the archive was opened with
    #[must_use]
    pub fn options(&self) -> &HarOptions {
        &self.options
    }

    /// Operating mode
    #[must_use]
    pub fn mode(&self) -> HarMode {
        self.options.mode
    }

    /// Dequeue the next recorded response for a request
    ///
    /// # Errors
    ///
    /// Returns error if the stored body is malformed
    pub fn lookup(&self, request: &Request) -> Result<Option<Response>> {
        let key = RequestKey::new(&request.method, &request.url, &request.body);

        let index = self.queues.get_mut(&key).and_then(|mut queue| {
            if queue.cursor >= queue.indices.len() {
                if !self.options.loop_entries || queue.indices.is_empty() {
                    return None;
                }
                queue.cursor = 0;
            }
            let index = queue.indices[queue.cursor];
            queue.cursor += 1;
            Some(index)
        });

        let Some(index) = index else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!("HAR miss: {}", key);
            return Ok(None);
        };

        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!("HAR hit: {} -> entry {}", key, index);
        self.entries[index].to_response().map(Some)
    }

    /// Append a live exchange
    pub fn record(
        &self,
        request: &Request,
        response: &Response,
        started: DateTime<Utc>,
        elapsed_ms: f64,
    ) {
        let entry = HarEntry::from_exchange(request, response, started, elapsed_ms);
        let mut recorded = self.recorded.lock();
        recorded.push(entry);
        debug!(
            "HAR recorded {} {} ({} entries)",
            request.method,
            request.url,
            recorded.len()
        );
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> HarStats {
        HarStats {
            entries: self.entries.len() + self.recorded.lock().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Snapshot as a HAR document (loaded entries followed by recorded ones)
    #[must_use]
    pub fn to_document(&self) -> HarDocument {
        let mut entries = self.entries.clone();
        entries.extend(self.recorded.lock().iter().cloned());
        HarDocument {
            log: HarLog {
                entries,
                ..HarLog::default()
            },
        }
    }

    /// Write the archive as pretty-printed JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization or the write fails
    pub fn save(&self, path: &Path) -> Result<()> {
        let document = self.to_document();
        let json = serde_json::to_vec_pretty(&document)?;
        std::fs::write(path, json)?;
        info!(
            "Saved HAR archive {} ({} entries)",
            path.display(),
            document.log.entries.len()
        );
        Ok(())
    }
}

/// Read and parse a HAR file
///
/// # Errors
///
/// Returns error if the file cannot be read or is not a HAR document
pub fn read_document(path: &Path) -> Result<HarDocument> {
    let content = std::fs::read(path).map_err(|e| {
        InterposeError::Other(format!("Failed to read HAR file {}: {e}", path.display()))
    })?;
    Ok(serde_json::from_slice(&content)?)
}

/// Entry counts per method and per distinct request key
#[must_use]
pub fn summarize(document: &HarDocument) -> (BTreeMap<String, usize>, BTreeMap<RequestKey, usize>) {
    let mut methods = BTreeMap::new();
    let mut keys = BTreeMap::new();

    for entry in &document.log.entries {
        let body = entry.request_body().unwrap_or_default();
        let key = RequestKey::new(&entry.request.method, &entry.request.url, &body);
        *methods.entry(key.method.clone()).or_insert(0) += 1;
        *keys.entry(key).or_insert(0) += 1;
    }

    (methods, keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn replay_options() -> HarOptions {
        HarOptions::default()
    }

    fn recorded_archive() -> HarArchive {
        let recorder = HarArchive::recorder(HarOptions {
            mode: HarMode::Record,
            ..HarOptions::default()
        });
        let request = Request::get("http://example.com/counter");
        recorder.record(&request, &Response::ok("1"), Utc::now(), 1.0);
        recorder.record(&request, &Response::ok("2"), Utc::now(), 1.0);
        recorder.record(
            &Request::get("http://example.com/other"),
            &Response::new(404),
            Utc::now(),
            1.0,
        );
        recorder
    }

    #[test]
    fn test_same_key_replayed_in_order() {
        let document = recorded_archive().to_document();
        let archive = HarArchive::from_document(document, replay_options()).unwrap();
        let request = Request::get("http://example.com/counter");

        assert_eq!(archive.lookup(&request).unwrap().unwrap().body, b"1");
        assert_eq!(archive.lookup(&request).unwrap().unwrap().body, b"2");
        assert!(archive.lookup(&request).unwrap().is_none());

        let stats = archive.stats();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_loop_entries_restarts_queue() {
        let document = recorded_archive().to_document();
        let archive = HarArchive::from_document(
            document,
            HarOptions {
                loop_entries: true,
                ..replay_options()
            },
        )
        .unwrap();
        let request = Request::get("http://example.com/counter");

        let bodies: Vec<Vec<u8>> = (0..4)
            .map(|_| archive.lookup(&request).unwrap().unwrap().body)
            .collect();
        assert_eq!(bodies, vec![b"1".to_vec(), b"2".to_vec(), b"1".to_vec(), b"2".to_vec()]);
    }

    #[test]
    fn test_unknown_key_misses() {
        let archive = HarArchive::from_document(recorded_archive().to_document(), replay_options())
            .unwrap();
        assert!(archive
            .lookup(&Request::new("POST", "http://example.com/counter"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_save_and_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.har");

        recorded_archive().save(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"startedDateTime\""));
        assert!(text.contains('\n'), "HAR output should be pretty-printed");

        let archive = HarArchive::open(&path, replay_options()).unwrap();
        assert_eq!(archive.stats().entries, 3);
        assert_eq!(
            archive
                .lookup(&Request::get("http://example.com/other"))
                .unwrap()
                .unwrap()
                .status,
            404
        );
    }

    #[test]
    fn test_open_missing_file_fails() {
        let dir = tempdir().unwrap();
        let result = HarArchive::open(&dir.path().join("missing.har"), replay_options());
        assert!(result.is_err());
    }

    #[test]
    fn test_summarize() {
        let (methods, keys) = summarize(&recorded_archive().to_document());
        assert_eq!(methods.get("GET"), Some(&3));
        assert_eq!(keys.len(), 2);
    }
}
