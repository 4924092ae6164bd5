use crate::{error::ArchiveError, messages::telemetry::camera::FrameMessage};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    thread::{self, JoinHandle},
};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

const CREATE_TABLE: &str = "
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL,
    width INTEGER,
    height INTEGER,
    fps REAL,
    chili_count INTEGER,
    jpg BLOB NOT NULL
)";

const INSERT_FRAME: &str = "INSERT INTO images (created_at, width, height, fps, chili_count, jpg) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

/// Where and how frames are archived.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ArchiveConfig {
    /// SQLite database file, created on first use.
    #[serde(default = "ArchiveConfig::default_database_path")]
    pub database_path: PathBuf,
    /// Frames waiting for the writer. Frames beyond this are dropped.
    #[serde(default = "ArchiveConfig::default_queue_capacity")]
    pub queue_capacity: usize,
}

impl ArchiveConfig {
    fn default_database_path() -> PathBuf {
        PathBuf::from("camera_frames.db")
    }

    fn default_queue_capacity() -> usize {
        16
    }

    pub fn new<P: Into<PathBuf>>(database_path: P) -> Self {
        Self {
            database_path: database_path.into(),
            queue_capacity: Self::default_queue_capacity(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self::new(Self::default_database_path())
    }
}

/// One archived frame. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub captured_at: DateTime<Utc>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub fps: Option<f64>,
    pub detected_count: Option<i64>,
    pub payload_bytes: Vec<u8>,
}

impl From<FrameMessage> for FrameRecord {
    fn from(frame: FrameMessage) -> Self {
        Self {
            captured_at: frame.captured_at,
            width: frame.metadata.width,
            height: frame.metadata.height,
            fps: frame.metadata.fps,
            detected_count: frame.metadata.chili_count,
            payload_bytes: frame.payload,
        }
    }
}

/// Append only frame table.
pub struct FrameStore {
    connection: Connection,
}

impl FrameStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ArchiveError> {
        let connection = Connection::open(path)?;
        connection.execute(CREATE_TABLE, [])?;
        Ok(Self { connection })
    }

    /// Insert one record as a single statement. Returns the row id.
    pub fn insert(&self, record: &FrameRecord) -> Result<i64, ArchiveError> {
        self.connection.execute(
            INSERT_FRAME,
            params![
                record
                    .captured_at
                    .to_rfc3339_opts(SecondsFormat::Secs, false),
                record.width,
                record.height,
                record.fps,
                record.detected_count,
                record.payload_bytes,
            ],
        )?;
        Ok(self.connection.last_insert_rowid())
    }

    pub fn count(&self) -> Result<u64, ArchiveError> {
        let count: i64 = self
            .connection
            .query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Payload and detection count of every row, oldest first.
    pub fn payloads(&self) -> Result<Vec<(Option<i64>, Vec<u8>)>, ArchiveError> {
        let mut statement = self
            .connection
            .prepare("SELECT chili_count, jpg FROM images ORDER BY id")?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let payloads = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(payloads)
    }
}

/// Persists frames on a dedicated writer thread so disk stalls never
/// reach the sensor delivery tasks. Submitting never blocks and never
/// fails the caller, frames are dropped and logged instead.
pub struct FrameArchiver {
    uuid: Uuid,
    sender: Option<mpsc::Sender<FrameRecord>>,
    worker: Option<JoinHandle<()>>,
}

impl FrameArchiver {
    /// Start the writer thread. The database is opened by the writer and
    /// reopened after a failure, so a missing disk only costs frames.
    pub fn start(config: &ArchiveConfig) -> Result<Self, ArchiveError> {
        let uuid = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let path = config.database_path.clone();

        let worker = thread::Builder::new()
            .name(String::from("frame-archive"))
            .spawn(move || write_frames(uuid, &path, receiver))?;

        Ok(Self {
            uuid,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn get_uuid(&self) -> Uuid {
        self.uuid
    }

    /// Queue a frame for the writer.
    pub fn try_store(&self, frame: FrameMessage) -> Result<(), ArchiveError> {
        let sender = self.sender.as_ref().ok_or(ArchiveError::WorkerStopped)?;
        sender
            .try_send(FrameRecord::from(frame))
            .map_err(|e| match e {
                TrySendError::Full(_) => ArchiveError::QueueFull,
                TrySendError::Closed(_) => ArchiveError::WorkerStopped,
            })
    }

    /// Queue a frame, logging and dropping it if the writer cannot take it.
    pub fn store(&self, frame: FrameMessage) {
        if let Err(e) = self.try_store(frame) {
            tracing::warn!(archive = %self.uuid, error = %e, "Dropped camera frame");
        }
    }

    /// Stop accepting frames and wait for queued frames to be written.
    /// Blocks the calling thread, async callers should use `spawn_blocking`.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!(archive = %self.uuid, "Frame archive writer panicked");
            }
        }
    }
}

/// Dropping without [`FrameArchiver::shutdown`] closes the queue and
/// detaches the writer, which finishes the queued frames on its own.
impl Drop for FrameArchiver {
    fn drop(&mut self) {
        if self.sender.take().is_some() {
            tracing::debug!(archive = %self.uuid, "Frame archive writer detached");
        }
    }
}

/// Writer loop. Runs until every sender is dropped.
fn write_frames(uuid: Uuid, path: &Path, mut receiver: mpsc::Receiver<FrameRecord>) {
    let mut store: Option<FrameStore> = None;

    while let Some(record) = receiver.blocking_recv() {
        let open_store = match store.take() {
            Some(open_store) => open_store,
            None => match FrameStore::open(path) {
                Ok(open_store) => open_store,
                Err(e) => {
                    tracing::error!(archive = %uuid, path = ?path, error = %e, "Failed to open frame archive");
                    continue;
                }
            },
        };

        // A failed insert drops the connection so the next frame reopens it.
        match open_store.insert(&record) {
            Ok(id) => {
                tracing::info!(
                    archive = %uuid,
                    id,
                    width = ?record.width,
                    height = ?record.height,
                    fps = ?record.fps,
                    count = ?record.detected_count,
                    bytes = record.payload_bytes.len(),
                    "Saved camera frame"
                );
                store = Some(open_store);
            }
            Err(e) => {
                tracing::error!(archive = %uuid, error = %e, "Failed to save camera frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::messages::telemetry::camera::CameraMetadata;
    use std::sync::Arc;

    fn frame(count: i64, payload: &[u8]) -> FrameMessage {
        FrameMessage {
            captured_at: Utc::now(),
            metadata: CameraMetadata {
                chili_count: Some(count),
                fps: Some(9.5),
                width: Some(640),
                height: Some(480),
            },
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_store_persists_frames_in_order() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = ArchiveConfig::new(dir.path().join("frames.db"));

        let archiver = FrameArchiver::start(&config).unwrap();
        for i in 0..3 {
            archiver.try_store(frame(i, &[i as u8; 4])).unwrap();
        }
        archiver.shutdown();

        let store = FrameStore::open(&config.database_path).unwrap();
        assert_eq!(store.count().unwrap(), 3);
        assert_eq!(
            store.payloads().unwrap(),
            vec![
                (Some(0), vec![0; 4]),
                (Some(1), vec![1; 4]),
                (Some(2), vec![2; 4])
            ]
        );
    }

    #[test]
    fn test_missing_metadata_is_stored_as_null() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = FrameStore::open(dir.path().join("frames.db")).unwrap();
        let record = FrameRecord::from(FrameMessage {
            captured_at: Utc::now(),
            metadata: CameraMetadata::default(),
            payload: b"jpeg".to_vec(),
        });
        store.insert(&record).unwrap();
        assert_eq!(store.payloads().unwrap(), vec![(None, b"jpeg".to_vec())]);
    }

    #[test]
    fn test_concurrent_stores_do_not_interleave() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut config = ArchiveConfig::new(dir.path().join("frames.db"));
        config.queue_capacity = 64;
        let archiver = Arc::new(FrameArchiver::start(&config).unwrap());

        let handles: Vec<_> = (0..4u8)
            .map(|producer| {
                let archiver = archiver.clone();
                thread::spawn(move || {
                    for _ in 0..8 {
                        archiver
                            .try_store(frame(i64::from(producer), &[producer; 1024]))
                            .expect("Queue sized for every frame");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("Producer panicked");
        }
        Arc::try_unwrap(archiver)
            .ok()
            .expect("Archiver still shared")
            .shutdown();

        let rows = FrameStore::open(&config.database_path)
            .unwrap()
            .payloads()
            .unwrap();
        assert_eq!(rows.len(), 32);
        for (count, payload) in rows {
            let producer = count.unwrap() as u8;
            assert!(payload.iter().all(|b| *b == producer), "Interleaved record");
        }
    }

    #[test]
    fn test_full_queue_rejects_frame_without_blocking() {
        // Writer not running, so nothing drains the queue.
        let (sender, _receiver) = mpsc::channel(1);
        let archiver = FrameArchiver {
            uuid: Uuid::new_v4(),
            sender: Some(sender),
            worker: None,
        };

        archiver.try_store(frame(0, b"first")).unwrap();
        assert!(matches!(
            archiver.try_store(frame(1, b"second")),
            Err(ArchiveError::QueueFull)
        ));
        archiver.store(frame(2, b"third"));
    }

    #[test]
    fn test_drop_detaches_writer_and_queued_frames_are_written() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = ArchiveConfig::new(dir.path().join("frames.db"));

        let archiver = FrameArchiver::start(&config).unwrap();
        archiver.try_store(frame(7, b"jpeg")).unwrap();
        drop(archiver);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let written = FrameStore::open(&config.database_path)
                .and_then(|store| store.count())
                .unwrap_or_default();
            if written == 1 {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "Detached writer did not finish"
            );
            thread::sleep(std::time::Duration::from_millis(10));
        }
    }

    #[test]
    fn test_unwritable_path_drops_frames_without_failing() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = ArchiveConfig::new(dir.path().join("missing").join("frames.db"));

        let archiver = FrameArchiver::start(&config).unwrap();
        archiver.store(frame(1, b"jpeg"));
        archiver.shutdown();

        assert!(!config.database_path.exists());
    }

    #[test]
    fn test_store_after_shutdown_reports_stopped() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut archiver =
            FrameArchiver::start(&ArchiveConfig::new(dir.path().join("frames.db"))).unwrap();
        archiver.stop();
        assert!(matches!(
            archiver.try_store(frame(0, b"x")),
            Err(ArchiveError::WorkerStopped)
        ));
    }
}
