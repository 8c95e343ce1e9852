use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::lock;
use crate::message::{BasicProperties, Message, RecordLocation};
use crate::store::record::{decode_payload, encode_record, scan_log, VALID_FLAG_OFFSET};
use crate::{Error, Result};

/// Depth and log health for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub depth: usize,
    pub file_size: u64,
    /// Invalidated records over all records in the log (0.0 for an empty log).
    pub invalid_ratio: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    pub live_records: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Ordered message container for a single queue, optionally backed by an
/// append-only log file.
///
/// The in-memory sequence and the log handle live under one lock, so a
/// peek-and-remove is atomic against concurrent publishers and consumers.
pub struct QueueStore {
    name: String,
    path: PathBuf,
    sync_writes: bool,
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    messages: VecDeque<Message>,
    log: Option<File>,
    write_offset: u64,
}

impl QueueStore {
    /// Creates a store whose log lives at `dir/<escaped name>.log`.
    ///
    /// Nothing is touched on disk until the first durable insert or an
    /// explicit `recovery()`.
    pub fn new(dir: impl AsRef<Path>, name: &str, sync_writes: bool) -> Self {
        Self::with_path(name.to_string(), dir.as_ref().join(log_file_name(name)), sync_writes)
    }

    /// Opens a store on an explicit log file, named after the file stem.
    /// Used by offline tooling that only has the path.
    pub fn at_path(path: impl Into<PathBuf>, sync_writes: bool) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::with_path(name, path, sync_writes)
    }

    fn with_path(name: String, path: PathBuf, sync_writes: bool) -> Self {
        Self {
            name,
            path,
            sync_writes,
            inner: Mutex::new(StoreInner {
                messages: VecDeque::new(),
                log: None,
                write_offset: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log_path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreInner>> {
        lock(&self.inner, "queue store")
    }

    /// Appends a message. Durable messages are written to the log first; if
    /// that write fails, or the record would be too large to recover, the
    /// message is not queued.
    pub fn insert(&self, properties: BasicProperties, body: Vec<u8>, durable: bool) -> Result<String> {
        let mut inner = self.lock()?;
        let mut message = Message::new(properties, body);
        if durable {
            let record = encode_record(&message.properties, &message.body).map_err(|err| {
                warn!("queue {}: refusing durable message: {err}", self.name);
                err
            })?;
            let location = self.append_record(&mut inner, &record)?;
            message.location = Some(location);
        }
        let id = message.properties.id.clone();
        inner.messages.push_back(message);
        Ok(id)
    }

    fn append_record(&self, inner: &mut StoreInner, record: &[u8]) -> Result<RecordLocation> {
        self.open_log(inner)?;
        let offset = inner.write_offset;
        let file = log_handle(inner)?;
        let written = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(record));
        if let Err(err) = written {
            error!("queue {}: log append failed: {err}", self.name);
            // Drop whatever part of the record made it out.
            let _ = file.set_len(offset);
            return Err(Error::Io(err));
        }
        if self.sync_writes {
            file.sync_data()?;
        }
        inner.write_offset = offset + record.len() as u64;
        Ok(RecordLocation {
            offset,
            len: record.len() as u32,
        })
    }

    fn open_log(&self, inner: &mut StoreInner) -> Result<()> {
        if inner.log.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;
        inner.write_offset = file.metadata()?.len();
        inner.log = Some(file);
        Ok(())
    }

    fn invalidate(&self, inner: &mut StoreInner, location: RecordLocation) -> Result<()> {
        self.open_log(inner)?;
        let file = log_handle(inner)?;
        file.seek(SeekFrom::Start(location.offset + VALID_FLAG_OFFSET))?;
        file.write_all(&[0u8])?;
        if self.sync_writes {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Oldest live message, left in place.
    pub fn front(&self) -> Result<Option<Message>> {
        Ok(self.lock()?.messages.front().cloned())
    }

    /// First live message carrying `id`, left in place.
    pub fn find(&self, id: &str) -> Result<Option<Message>> {
        Ok(self
            .lock()?
            .messages
            .iter()
            .find(|m| m.properties.id == id)
            .cloned())
    }

    /// Removes the head when `id` is empty, otherwise the first message with
    /// that id. Returns the removed message, if any.
    pub fn remove(&self, id: &str) -> Result<Option<Message>> {
        let mut inner = self.lock()?;
        let index = if id.is_empty() {
            if inner.messages.is_empty() {
                None
            } else {
                Some(0)
            }
        } else {
            inner.messages.iter().position(|m| m.properties.id == id)
        };
        match index {
            Some(index) => self.remove_at(&mut inner, index),
            None => Ok(None),
        }
    }

    /// Removes and returns the oldest live message.
    pub fn pop_front(&self) -> Result<Option<Message>> {
        let mut inner = self.lock()?;
        if inner.messages.is_empty() {
            return Ok(None);
        }
        self.remove_at(&mut inner, 0)
    }

    fn remove_at(&self, inner: &mut StoreInner, index: usize) -> Result<Option<Message>> {
        // Invalidate on disk first so a failed write leaves the message queued.
        if let Some(location) = inner.messages.get(index).and_then(|m| m.location) {
            self.invalidate(inner, location)?;
        }
        Ok(inner.messages.remove(index))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.messages.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.messages.is_empty())
    }

    /// Snapshot of the live sequence in order.
    pub fn messages(&self) -> Result<Vec<Message>> {
        Ok(self.lock()?.messages.iter().cloned().collect())
    }

    /// Rebuilds the live sequence from the log.
    ///
    /// Every valid record is restored in file order with its original
    /// offset and length. A missing log leaves the store untouched. Records
    /// with a damaged header or checksum are skipped and stay on disk. A torn
    /// trailing record is cut off so later appends start on a record
    /// boundary. Bytes past an unreadable length field are copied to
    /// `<name>.log.corrupt` before the cut.
    pub fn recovery(&self) -> Result<usize> {
        let mut inner = self.lock()?;
        if inner.log.is_none() && !self.path.exists() {
            return Ok(0);
        }
        let image = std::fs::read(&self.path)?;

        let mut recovered = VecDeque::new();
        let mut undecodable = 0usize;
        let summary = scan_log(&image, |record| {
            if !record.header.valid {
                return;
            }
            match decode_payload(record.payload) {
                Ok((properties, body)) => recovered.push_back(Message {
                    properties,
                    body,
                    location: Some(record.location),
                }),
                Err(_) => undecodable += 1,
            }
        });

        if summary.corrupt > 0 || undecodable > 0 {
            warn!(
                "queue {}: skipped {} damaged records and {} undecodable records",
                self.name, summary.corrupt, undecodable
            );
        }

        if let Some(offset) = summary.unframed_at {
            let aside = self.path.with_extension("log.corrupt");
            error!(
                "queue {}: unreadable record length at offset {offset}, moving {} bytes to {}",
                self.name,
                image.len() as u64 - offset,
                aside.display()
            );
            write_synced(&aside, &image[offset as usize..])?;
        }

        self.open_log(&mut inner)?;
        let file = log_handle(&mut inner)?;
        if summary.unframed_at.is_some() {
            file.set_len(summary.clean_end)?;
        } else if summary.torn_tail {
            warn!(
                "queue {}: truncating torn record at offset {}",
                self.name, summary.clean_end
            );
            file.set_len(summary.clean_end)?;
        }
        inner.write_offset = summary.clean_end;

        let count = recovered.len();
        inner.messages = recovered;
        info!(
            "queue {}: recovered {} live of {} records",
            self.name, count, summary.total
        );
        Ok(count)
    }

    /// Rewrites the log with only the live durable messages, in their
    /// current order, then swaps it in with a rename.
    pub fn compact(&self) -> Result<CompactionReport> {
        let mut inner = self.lock()?;
        let bytes_before = file_len(&self.path)?;
        if inner.log.is_none() && !self.path.exists() {
            return Ok(CompactionReport::default());
        }

        let tmp_path = self.path.with_extension("log.tmp");
        let written = match write_compacted(&tmp_path, &inner.messages) {
            Ok(written) => {
                inner.log = None;
                std::fs::rename(&tmp_path, &self.path)
                    .map(|_| written)
                    .map_err(Error::Io)
            }
            Err(err) => Err(err),
        };
        let (locations, offset) = match written {
            Ok(written) => written,
            Err(err) => {
                error!("queue {}: compaction failed: {err}", self.name);
                if let Err(cleanup) = std::fs::remove_file(&tmp_path) {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(
                            "queue {}: could not remove {}: {cleanup}",
                            self.name,
                            tmp_path.display()
                        );
                    }
                }
                return Err(err);
            }
        };

        let mut fresh = locations.into_iter();
        for message in inner.messages.iter_mut().filter(|m| m.location.is_some()) {
            message.location = fresh.next();
        }
        let live_records = inner.messages.iter().filter(|m| m.location.is_some()).count();
        self.open_log(&mut inner)?;
        inner.write_offset = offset;

        let report = CompactionReport {
            live_records,
            bytes_before,
            bytes_after: offset,
        };
        info!(
            "queue {}: compacted log {} -> {} bytes ({} live records)",
            self.name, report.bytes_before, report.bytes_after, report.live_records
        );
        Ok(report)
    }

    /// Current depth plus a full scan of the log for the invalid ratio.
    pub fn stats(&self) -> Result<QueueStats> {
        let inner = self.lock()?;
        let depth = inner.messages.len();
        if !self.path.exists() {
            return Ok(QueueStats {
                depth,
                ..QueueStats::default()
            });
        }
        let image = std::fs::read(&self.path)?;
        let summary = scan_log(&image, |_| {});
        let invalid_ratio = if summary.total == 0 {
            0.0
        } else {
            summary.invalid as f64 / summary.total as f64
        };
        Ok(QueueStats {
            depth,
            file_size: image.len() as u64,
            invalid_ratio,
        })
    }

    /// Drops every message and deletes the log file.
    pub fn destroy(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.messages.clear();
        inner.log = None;
        inner.write_offset = 0;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("queue {}: removed log {}", self.name, self.path.display());
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::Io(err)),
        }
    }
}

/// Writes the durable messages of `messages` back to back into `path` and
/// returns their new locations plus the total length.
fn write_compacted(path: &Path, messages: &VecDeque<Message>) -> Result<(Vec<RecordLocation>, u64)> {
    let mut tmp = File::create(path)?;
    let mut locations = Vec::with_capacity(messages.len());
    let mut offset = 0u64;
    for message in messages.iter().filter(|m| m.location.is_some()) {
        let record = encode_record(&message.properties, &message.body)?;
        tmp.write_all(&record)?;
        locations.push(RecordLocation {
            offset,
            len: record.len() as u32,
        });
        offset += record.len() as u64;
    }
    tmp.sync_all()?;
    Ok((locations, offset))
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn log_handle(inner: &mut StoreInner) -> Result<&mut File> {
    inner
        .log
        .as_mut()
        .ok_or(Error::Corrupt("queue log handle missing"))
}

fn file_len(path: &Path) -> Result<u64> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(Error::Io(err)),
    }
}

/// File name for a queue's log; bytes outside `[A-Za-z0-9_-]` are
/// percent-escaped so any queue name maps to a single flat file.
pub fn log_file_name(queue: &str) -> String {
    let mut name = String::with_capacity(queue.len() + 4);
    for byte in queue.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("%{byte:02X}"));
        }
    }
    name.push_str(".log");
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::record::MAX_RECORD_LEN;
    use tempfile::tempdir;

    fn props(id: &str) -> BasicProperties {
        BasicProperties {
            id: id.to_string(),
            ..BasicProperties::default()
        }
    }

    fn bodies(store: &QueueStore) -> Vec<Vec<u8>> {
        store
            .messages()
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect()
    }

    fn live_ids(store: &QueueStore) -> Vec<String> {
        store
            .messages()
            .unwrap()
            .into_iter()
            .map(|m| m.properties.id)
            .collect()
    }

    #[test]
    fn escapes_log_names() {
        assert_eq!(log_file_name("orders"), "orders.log");
        assert_eq!(log_file_name("a.b/c"), "a%2Eb%2Fc.log");
    }

    #[test]
    fn transient_store_never_touches_disk() {
        let dir = tempdir().unwrap();
        let store = QueueStore::new(dir.path(), "t", false);
        store.insert(props("1"), b"a".to_vec(), false).unwrap();
        assert!(!store.log_path().exists());
        assert_eq!(store.stats().unwrap().depth, 1);
        assert_eq!(store.recovery().unwrap(), 0);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn remove_by_id_and_head() {
        let dir = tempdir().unwrap();
        let store = QueueStore::new(dir.path(), "q", false);
        for id in ["1", "2", "3"] {
            store.insert(props(id), id.as_bytes().to_vec(), true).unwrap();
        }
        let removed = store.remove("2").unwrap().unwrap();
        assert_eq!(removed.body, b"2");
        assert!(store.remove("missing").unwrap().is_none());
        assert_eq!(store.remove("").unwrap().unwrap().body, b"1");
        assert_eq!(bodies(&store), vec![b"3".to_vec()]);
    }

    #[test]
    fn stats_report_invalid_ratio() {
        let dir = tempdir().unwrap();
        let store = QueueStore::new(dir.path(), "q", false);
        for id in ["1", "2", "3", "4"] {
            store.insert(props(id), vec![0u8; 16], true).unwrap();
        }
        store.remove("1").unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.depth, 3);
        assert!((stats.invalid_ratio - 0.25).abs() < f64::EPSILON);
        assert_eq!(
            stats.file_size,
            std::fs::metadata(store.log_path()).unwrap().len()
        );
    }

    #[test]
    fn compact_drops_invalid_records() {
        let dir = tempdir().unwrap();
        let store = QueueStore::new(dir.path(), "q", false);
        for id in ["1", "2", "3"] {
            store.insert(props(id), id.as_bytes().to_vec(), true).unwrap();
        }
        store.remove("2").unwrap();
        let report = store.compact().unwrap();
        assert_eq!(report.live_records, 2);
        assert!(report.bytes_after < report.bytes_before);

        let stats = store.stats().unwrap();
        assert_eq!(stats.invalid_ratio, 0.0);

        // Offsets were reassigned, so removal still hits the right record.
        store.remove("3").unwrap();
        assert_eq!(store.recovery().unwrap(), 1);
        assert_eq!(bodies(&store), vec![b"1".to_vec()]);
    }

    #[test]
    fn recovery_truncates_torn_tail() {
        let dir = tempdir().unwrap();
        let path = {
            let store = QueueStore::new(dir.path(), "q", false);
            store.insert(props("1"), b"keep".to_vec(), true).unwrap();
            store.log_path().to_path_buf()
        };
        let clean_len = std::fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[9, 0, 0]).unwrap();
        drop(file);

        let store = QueueStore::new(dir.path(), "q", false);
        assert_eq!(store.recovery().unwrap(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), clean_len);

        store.insert(props("2"), b"next".to_vec(), true).unwrap();
        let again = QueueStore::new(dir.path(), "q", false);
        assert_eq!(again.recovery().unwrap(), 2);
    }

    #[test]
    fn destroy_removes_log() {
        let dir = tempdir().unwrap();
        let store = QueueStore::new(dir.path(), "q", false);
        store.insert(props("1"), b"x".to_vec(), true).unwrap();
        store.destroy().unwrap();
        assert!(!store.log_path().exists());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn recovery_skips_damaged_header_and_keeps_later_records() {
        let dir = tempdir().unwrap();
        let path = {
            let store = QueueStore::new(dir.path(), "q", false);
            for id in ["1", "2", "3"] {
                store.insert(props(id), id.as_bytes().to_vec(), true).unwrap();
            }
            let second = store.messages().unwrap()[1].location.unwrap();
            let mut file = OpenOptions::new().write(true).open(store.log_path()).unwrap();
            file.seek(SeekFrom::Start(second.offset + VALID_FLAG_OFFSET))
                .unwrap();
            file.write_all(&[0xff]).unwrap();
            store.log_path().to_path_buf()
        };
        let len_before = std::fs::metadata(&path).unwrap().len();

        let store = QueueStore::new(dir.path(), "q", false);
        assert_eq!(store.recovery().unwrap(), 2);
        assert_eq!(bodies(&store), vec![b"1".to_vec(), b"3".to_vec()]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len_before);

        store.insert(props("4"), b"4".to_vec(), true).unwrap();
        let again = QueueStore::new(dir.path(), "q", false);
        assert_eq!(again.recovery().unwrap(), 3);
    }

    #[test]
    fn recovery_sets_aside_unframed_bytes() {
        let dir = tempdir().unwrap();
        let path = {
            let store = QueueStore::new(dir.path(), "q", false);
            store.insert(props("1"), b"keep".to_vec(), true).unwrap();
            store.log_path().to_path_buf()
        };
        let clean_len = std::fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xff; 16]).unwrap();
        drop(file);

        let store = QueueStore::new(dir.path(), "q", false);
        assert_eq!(store.recovery().unwrap(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), clean_len);
        let aside = std::fs::read(path.with_extension("log.corrupt")).unwrap();
        assert_eq!(aside, vec![0xff; 16]);
    }

    #[test]
    fn oversized_durable_insert_is_rejected() {
        let dir = tempdir().unwrap();
        let store = QueueStore::new(dir.path(), "q", false);
        store.insert(props("before"), b"small".to_vec(), true).unwrap();
        let err = store
            .insert(props("huge"), vec![0u8; MAX_RECORD_LEN], true)
            .unwrap_err();
        assert!(matches!(err, Error::RecordTooLarge { .. }));
        store.insert(props("after"), b"small".to_vec(), true).unwrap();
        assert_eq!(store.len().unwrap(), 2);

        let again = QueueStore::new(dir.path(), "q", false);
        assert_eq!(again.recovery().unwrap(), 2);
        assert_eq!(live_ids(&again), vec!["before", "after"]);
    }

    #[test]
    fn failed_compaction_removes_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.log");
        let store = QueueStore::at_path(&path, false);
        store.insert(props("1"), b"1".to_vec(), true).unwrap();

        // Replace the log with a non-empty directory so the final rename fails.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), b"x").unwrap();

        assert!(store.compact().is_err());
        assert!(!path.with_extension("log.tmp").exists());
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn concurrent_pops_deliver_each_message_once() {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(QueueStore::new(dir.path(), "q", false));
        let total = 400;
        for i in 0..total {
            store.insert(props(&i.to_string()), Vec::new(), true).unwrap();
        }
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(message) = store.pop_front().unwrap() {
                        seen.push(message.properties.id);
                    }
                    seen
                })
            })
            .collect();
        let mut ids: Vec<usize> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .map(|id| id.parse().unwrap())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..total).collect::<Vec<_>>());
        assert_eq!(store.recovery().unwrap(), 0);
    }
}
