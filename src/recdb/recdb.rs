// SPDX-License-Identifier: GPL-2.0-or-later

// Recordings are stored in the following format.
// The recording ID is the start time of the recording plus the monitor ID.
// Plugins can attach arbitrary data to recordings.
//
// <YYYY>
// └── <MM>
//     └── <DD>
//         └── <MonitorID>
//             └── <YYYY-MM-DD_HH-MM-SS>_<MonitorID>
//                 ├── thumb_<Width>x<Height>.jpeg  // Thumbnail.
//                 ├── video_<Width>x<Height>.meta  // Video metadata.
//                 ├── video_<Width>x<Height>.mdat  // Raw video data.
//                 ├── <UnixNano>.end               // Empty file, end timestamp.
//                 └── my_plugin_data               // File created by plugin.
//
// The presence of the end timestamp file indicates that the recording was finalized.

mod crawler;

pub use crawler::CrawlerError;

use bytesize::ByteSize;
use common::{
    ArcLogger, FILE_MODE, LogEntry, LogLevel, MonitorId,
    recording::{RecordingId, RecordingIdError},
    time::{UnixH264, UnixNano},
};
use crawler::Crawler;
use csv::deserialize_csv_option;
use fs::dir_fs;
use serde::Deserialize;
use std::{
    borrow::ToOwned,
    collections::{HashMap, HashSet},
    num::NonZeroUsize,
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{File, OpenOptions},
    runtime::Handle,
};

// Query of recordings for crawler to find.
#[derive(Clone, Debug, Deserialize)]
pub struct RecDbQuery {
    #[serde(rename = "recording-id")]
    pub recording_id: RecordingId,

    // This is not part of the public API.
    #[serde(default)]
    pub end: Option<UnixNano>,

    pub limit: NonZeroUsize,

    #[serde(rename = "oldest-first")]
    pub oldest_first: bool,

    #[serde(default)]
    #[serde(deserialize_with = "deserialize_csv_option")]
    pub monitors: Vec<String>,

    // If event data should be read from file and included.
    #[serde(rename = "include-data")]
    pub include_data: bool,
}

#[derive(Debug)]
pub enum RecordingResponse {
    // Recording in progress.
    Active(RecordingActive),

    // Recording finished successfully
    Finalized(RecordingFinalized),

    // Something happend before the end file was written.
    Incomplete(RecordingIncomplete),
}

impl RecordingResponse {
    #[must_use]
    pub fn id(&self) -> &RecordingId {
        match self {
            RecordingResponse::Active(v) => &v.id,
            RecordingResponse::Finalized(v) => &v.id,
            RecordingResponse::Incomplete(v) => &v.id,
        }
    }

    #[cfg(test)]
    #[track_caller]
    pub(crate) fn assert_finalized(&self) -> &RecordingFinalized {
        match self {
            RecordingResponse::Active(v) => {
                panic!("expected finalized, got: {v:?}")
            }
            RecordingResponse::Finalized(v) => v,
            RecordingResponse::Incomplete(v) => {
                panic!("expected finalized, got: {v:?}")
            }
        }
    }
}

#[derive(Debug)]
pub struct RecordingActive {
    pub id: RecordingId,
    pub end: UnixNano,
}

#[derive(Debug)]
pub struct RecordingFinalized {
    pub id: RecordingId,
    pub end: UnixNano,
}

#[derive(Debug)]
pub struct RecordingIncomplete {
    pub id: RecordingId,
}

pub struct RecDb {
    logger: RecDbLogger,
    recordings_dir: PathBuf,
    crawler: Crawler,

    // There should only be one active recording per monitor.
    active_recordings: Arc<std::sync::Mutex<HashMap<RecordingId, ActiveRec>>>,
}

#[derive(Clone, Debug)]
struct ActiveRec {
    end_time: UnixH264,
}

#[derive(Debug, Error)]
pub enum NewRecordingError {
    #[error("recording is already active")]
    AlreadyActive,

    #[error("recording already exists")]
    AlreadyExist,

    #[error("create directory for recording: {0}")]
    CreateDir(std::io::Error),

    #[error("parse recording id: {0}")]
    RecId(#[from] RecordingIdError),
}

#[derive(Debug, Error)]
pub enum DeleteRecordingError {
    #[error("deleting active recordings is not implemented")]
    Active,

    #[error("recording doesn't exist: {0}")]
    NotExist(PathBuf),

    #[error("read dir: {0}")]
    ReadDir(std::io::Error),

    #[error("dir entry: {0}")]
    DirEntry(std::io::Error),

    #[error("read metadata: {0}")]
    ReadMetadata(std::io::Error),

    #[error("delete file: {0}")]
    Delete(std::io::Error),

    #[error("directory doesn't have a parent: {0}")]
    DirNoParent(PathBuf),

    #[error("remove empty directory: {0}")]
    RemoveEmptyDir(std::io::Error),
}

#[derive(Debug, Error)]
#[error("create directory: {0}")]
pub struct CreateRecDbError(#[from] std::io::Error);

impl RecDb {
    pub async fn new(
        logger: ArcLogger,
        recordings_dir: PathBuf,
    ) -> Result<Self, CreateRecDbError> {
        common::create_dir_all2(Handle::current(), recordings_dir.clone()).await?;

        let crawler = Crawler::new(dir_fs(recordings_dir.clone()));

        Ok(Self {
            logger: RecDbLogger(logger),
            recordings_dir,
            crawler,
            active_recordings: Arc::new(std::sync::Mutex::new(HashMap::new())),
        })
    }

    // finds the best matching recording and
    // returns limit number of subsequent recorings.
    pub async fn recordings_by_query(
        &self,
        query: &RecDbQuery,
    ) -> Result<Vec<RecordingResponse>, CrawlerError> {
        // Do not hold onto the lock.
        let active_recordings = self.active_recordings.lock().expect("not poisoned").clone();
        self.crawler
            .recordings_by_query(query.clone(), active_recordings)
            .await
    }

    pub async fn recording_path(&self, rec_id: &RecordingId) -> Option<PathBuf> {
        let path = self.recordings_dir.join(rec_id.full_path());
        let path = tokio::fs::canonicalize(path).await.ok()?;

        let is_path_safe = path.starts_with(&self.recordings_dir);
        if !is_path_safe {
            return None;
        };
        Some(path)
    }

    // Returns the full path of file tied to recording id by file name.
    pub async fn recording_file(&self, rec_id: &RecordingId, name: &str) -> Option<PathBuf> {
        let path = self.recordings_dir.join(rec_id.full_path()).join(name);
        let path = tokio::fs::canonicalize(path).await.ok()?;

        let is_path_safe = path.starts_with(&self.recordings_dir);
        if !is_path_safe {
            return None;
        };
        Some(path)
    }

    async fn recording_files(&self, rec_id: &RecordingId) -> Vec<String> {
        let dir = self.recordings_dir.join(rec_id.full_path());
        tokio::task::spawn_blocking(|| {
            std::fs::read_dir(dir)
                .ok()
                .into_iter()
                .flatten()
                .flatten()
                .filter_map(|entry| entry.file_name().to_str().map(ToOwned::to_owned))
                .collect()
        })
        .await
        .expect("join")
    }

    // Returns full path to the thumbnail file for specified recording id.
    pub async fn recording_thumbnail_path(&self, rec_id: &RecordingId) -> Option<PathBuf> {
        for name in self.recording_files(rec_id).await {
            if name.starts_with("thumb_") {
                return self.recording_file(rec_id, &name).await;
            }
        }
        None
    }

    pub async fn recording_video_paths(&self, rec_id: &RecordingId) -> Option<(PathBuf, PathBuf)> {
        let mut meta_path = None;
        let mut mdat_path = None;
        for file in self.recording_files(rec_id).await {
            if !file.starts_with("video") {
                continue;
            }
            if file.ends_with("meta") {
                meta_path = self.recording_file(rec_id, &file).await;
            }
            if file.ends_with("mdat") {
                mdat_path = self.recording_file(rec_id, &file).await;
            }
        }
        if let (Some(meta_path), Some(mdat_path)) = (meta_path, mdat_path) {
            Some((meta_path, mdat_path))
        } else {
            None
        }
    }

    pub async fn new_recording(
        &self,
        monitor_id: MonitorId,
        start_time: UnixH264,
    ) -> Result<RecordingHandle, NewRecordingError> {
        use NewRecordingError::*;

        let rec_id = RecordingId::from_nanos(start_time.into(), monitor_id)?;
        let path = self.recordings_dir.join(rec_id.full_path());
        if path.exists() {
            return Err(AlreadyExist);
        }

        common::create_dir_all2(Handle::current(), path.clone())
            .await
            .map_err(CreateDir)?;

        {
            let mut active_recordings = self.active_recordings.lock().expect("not poisoned");
            if active_recordings.contains_key(&rec_id) {
                return Err(AlreadyActive);
            }
            // Function must be infallible after id has been added.
            active_recordings.insert(
                rec_id.clone(),
                ActiveRec {
                    end_time: start_time,
                },
            );
            drop(active_recordings);
        }

        Ok(RecordingHandle {
            active_recordings: self.active_recordings.clone(),
            id: rec_id,
            path,
            open_files: Arc::new(std::sync::Mutex::new(HashSet::new())),
        })
    }

    fn recording_is_active(&self, rec_id: &RecordingId) -> bool {
        self.active_recordings
            .lock()
            .expect("not poisoned")
            .contains_key(rec_id)
    }

    // Returns total size of delete files and maybe one error.
    pub async fn recording_delete(
        &self,
        rec_id: RecordingId,
    ) -> (ByteSize, Option<DeleteRecordingError>) {
        if self.recording_is_active(&rec_id) {
            return (ByteSize(0), Some(DeleteRecordingError::Active));
        }

        let Some(mut rec_dir) = self.recording_path(&rec_id).await else {
            return (
                ByteSize(0),
                Some(DeleteRecordingError::NotExist(
                    self.recordings_dir.join(rec_id.full_path()),
                )),
            );
        };

        tokio::task::spawn_blocking(move || {
            let mut num_deleted_bytes = ByteSize(0);
            let mut err = None;
            let recording_files = match rec_dir.read_dir() {
                Ok(v) => v,
                Err(e) => return (ByteSize(0), Some(DeleteRecordingError::ReadDir(e))),
            };
            for file in recording_files {
                let path = match file {
                    Ok(v) => v.path(),
                    Err(e) => {
                        err = Some(DeleteRecordingError::DirEntry(e));
                        continue;
                    }
                };
                let file_size = match path.metadata() {
                    Ok(v) => v.len(),
                    Err(e) => {
                        err = Some(DeleteRecordingError::ReadMetadata(e));
                        continue;
                    }
                };
                if let Err(e) = std::fs::remove_file(path) {
                    err = Some(DeleteRecordingError::Delete(e));
                };
                num_deleted_bytes.0 += file_size;
            }
            // Remove empty directories up to the recordings directory.
            // Levels: recording dir, monitor, day, month, year.
            for _ in 0..5 {
                let num_files = match rec_dir.read_dir() {
                    Ok(v) => v.count(),
                    Err(e) => {
                        err = Some(DeleteRecordingError::ReadDir(e));
                        break;
                    }
                };

                if num_files == 0 {
                    if let Err(e) = std::fs::remove_dir(&rec_dir) {
                        err = Some(DeleteRecordingError::RemoveEmptyDir(e));
                        break;
                    }
                } else {
                    break;
                }

                if let Some(v) = rec_dir.parent() {
                    rec_dir = v.to_path_buf();
                } else {
                    err = Some(DeleteRecordingError::DirNoParent(rec_dir));
                    break;
                };
            }

            (num_deleted_bytes, err)
        })
        .await
        .expect("join")
    }

    pub async fn test_recording(&self) -> RecordingHandle {
        #[allow(clippy::unwrap_used)]
        self.new_recording("test".to_owned().try_into().unwrap(), UnixH264::new(1))
            .await
            .unwrap()
    }

    #[cfg(test)]
    async fn count_recordings(&self) -> usize {
        #[allow(clippy::unwrap_used)]
        self.recordings_by_query(&RecDbQuery {
            recording_id: RecordingId::max(),
            end: None,
            limit: NonZeroUsize::new(1000).unwrap(),
            oldest_first: false,
            monitors: Vec::new(),
            include_data: false,
        })
        .await
        .unwrap()
        .len()
    }

}

#[derive(Debug)]
pub struct RecordingHandle {
    active_recordings: Arc<std::sync::Mutex<HashMap<RecordingId, ActiveRec>>>,
    id: RecordingId,

    path: PathBuf,
    open_files: Arc<std::sync::Mutex<HashSet<String>>>,
}

#[derive(Debug, Error)]
pub enum OpenFileError {
    #[error("a file with this extension is already open")]
    AlreadyOpen,

    #[error("open file: {0} {1}")]
    OpenFile(PathBuf, std::io::Error),
}

impl RecordingHandle {
    #[must_use]
    pub fn id(&self) -> &RecordingId {
        &self.id
    }

    pub async fn new_file(&self, name: &str) -> Result<FileHandle, OpenFileError> {
        let mut options = OpenOptions::new();
        let options = options.create_new(true).mode(FILE_MODE).write(true);
        self.open_file_with_opts(name.to_owned(), options).await
    }

    pub async fn open_file(&self, name: &str) -> Result<FileHandle, OpenFileError> {
        let mut options = OpenOptions::new();
        let options = options.write(true).read(true);
        self.open_file_with_opts(name.to_owned(), options).await
    }

    pub async fn open_file_with_opts(
        &self,
        name: String,
        options: &OpenOptions,
    ) -> Result<FileHandle, OpenFileError> {
        use OpenFileError::*;

        let path = self.path.join(Path::new(&name));
        let file = options
            .open(&path)
            .await
            .map_err(|e| OpenFile(path.clone(), e))?;

        {
            let mut open_files = self.open_files.lock().expect("not poisoned");
            if open_files.contains(&name) {
                return Err(AlreadyOpen);
            }
            // Function must be infallible after file has been added.
            open_files.insert(name.clone());
        }

        Ok(FileHandle {
            open_files: self.open_files.clone(),
            name,
            path,
            file,
        })
    }

    pub fn set_end_time(&self, end_time: UnixH264) {
        self.active_recordings
            .lock()
            .expect("not poisoned")
            .get_mut(&self.id)
            .expect("should exist")
            .end_time = end_time;
    }
}

impl Drop for RecordingHandle {
    fn drop(&mut self) {
        assert!(
            self.active_recordings
                .lock()
                .expect("not poisoned")
                .remove(&self.id)
                .is_some(),
            "recording id should have been in hashmap"
        );
    }
}

pub struct FileHandle {
    open_files: Arc<std::sync::Mutex<HashSet<String>>>,
    name: String,
    path: PathBuf,
    file: File,
}

impl FileHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        assert!(
            self.open_files
                .lock()
                .expect("not poisoned")
                .remove(&self.name),
            "extension should be in hashset"
        );
    }
}

impl Deref for FileHandle {
    type Target = File;

    fn deref(&self) -> &Self::Target {
        &self.file
    }
}

impl DerefMut for FileHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.file
    }
}

struct RecDbLogger(ArcLogger);

impl RecDbLogger {
    fn log(&self, level: LogLevel, monitor_id: &MonitorId, msg: &str) {
        self.0.log(LogEntry::new(level, "recdb", monitor_id, msg));
    }
    fn log2(&self, level: LogLevel, msg: &str) {
        self.0.log(LogEntry::new2(level, "recdb", msg));
    }
}
