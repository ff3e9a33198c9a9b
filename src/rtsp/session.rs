// SPDX-License-Identifier: GPL-2.0-or-later

use crate::error::{DescribeError, PublisherAddError, ReaderAddError, SetupError};
use crate::path::Path;
use crate::path_manager::PathManager;
use rand::Rng as _;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

const SESSION_ID_MIN: u64 = 100_000_000;
const SESSION_ID_SPREAD: u64 = 900_000_000;

// Picks a session ID uniformly from [1e8, 1e8 + 9e8), rejecting collisions
// against the currently live set.
pub fn new_session_id(live: &Mutex<HashSet<u64>>) -> u64 {
    let mut live = live.lock().expect("lock not poisoned");
    loop {
        let id = rand::rng().random_range(SESSION_ID_MIN..SESSION_ID_MIN + SESSION_ID_SPREAD);
        if live.insert(id) {
            return id;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Publishing,
    Reading,
}

enum Role {
    None,
    Publisher { path_name: String, path: Path },
    Reader { path_name: String },
}

// One RTSP client's server-side state. ANNOUNCE/SETUP/RECORD drive a
// session into the publisher role; DESCRIBE/SETUP/PLAY drive it into the
// reader role. A session can only ever hold one role at a time.
pub struct Session {
    pub id: u64,
    path_manager: PathManager,
    inner: AsyncMutex<Inner>,
}

struct Inner {
    state: SessionState,
    role: Role,
    tracks: Vec<usize>,
}

impl Session {
    #[must_use]
    pub fn new(id: u64, path_manager: PathManager) -> Self {
        Self {
            id,
            path_manager,
            inner: AsyncMutex::new(Inner {
                state: SessionState::Idle,
                role: Role::None,
                tracks: Vec::new(),
            }),
        }
    }

    pub async fn on_describe(&self, path_name: &str) -> Result<Arc<crate::stream::Stream>, DescribeError> {
        self.path_manager.describe(path_name.to_owned()).await
    }

    // ANNOUNCE: reserves the publisher role for `path_name`. Fails with
    // `Busy` if another session already holds it.
    pub async fn on_announce(&self, path_name: &str) -> Result<(), PublisherAddError> {
        let path = self
            .path_manager
            .publisher_add(path_name.to_owned(), self.id)
            .await?;
        let mut inner = self.inner.lock().await;
        inner.role = Role::Publisher {
            path_name: path_name.to_owned(),
            path,
        };
        Ok(())
    }

    // SETUP for an incoming publish: requires a prior ANNOUNCE for the same
    // path (404 if absent) and a valid track index (400 otherwise).
    pub async fn on_setup_publish(&self, track_index: usize) -> Result<(), SetupError> {
        let mut inner = self.inner.lock().await;
        match &inner.role {
            Role::Publisher { .. } => {
                if track_index > 0 {
                    return Err(SetupError::TrackNotExist(track_index));
                }
                inner.tracks.push(track_index);
                Ok(())
            }
            _ => Err(SetupError::PathNotExist),
        }
    }

    // SETUP for a read session: path must currently have a publisher.
    pub async fn on_setup_play(&self, path_name: &str, track_index: usize) -> Result<(), SetupError> {
        if track_index > 0 {
            return Err(SetupError::TrackNotExist(track_index));
        }
        if self.path_manager.describe(path_name.to_owned()).await.is_err() {
            return Err(SetupError::PathNotExist);
        }
        let mut inner = self.inner.lock().await;
        inner.role = Role::Reader {
            path_name: path_name.to_owned(),
        };
        inner.tracks.push(track_index);
        Ok(())
    }

    pub async fn on_record(&self) -> Result<(), PublisherAddError> {
        let mut inner = self.inner.lock().await;
        inner.state = SessionState::Publishing;
        Ok(())
    }

    pub async fn on_play(&self) -> Result<tokio::sync::broadcast::Receiver<common::H264Data>, ReaderAddError> {
        let inner = self.inner.lock().await;
        let Role::Reader { path_name } = &inner.role else {
            return Err(ReaderAddError::NoOnePublishing);
        };
        let reader = self.path_manager.reader_add(path_name.clone()).await?;
        drop(inner);
        self.inner.lock().await.state = SessionState::Reading;
        Ok(reader.feed)
    }

    pub async fn on_pause(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = SessionState::Idle;
    }

    // Publisher-side access unit write, keyed by the setup-confirmed track.
    pub async fn on_packet_access_unit(
        &self,
        track_id: u8,
        nals: Vec<Vec<u8>>,
        pts: common::time::UnixH264,
    ) -> Result<(), crate::error::WriteAccessUnitError> {
        let inner = self.inner.lock().await;
        let Role::Publisher { path, .. } = &inner.role else {
            return Ok(());
        };
        path.publisher_write(self.id, track_id, nals, pts).await
    }

    // Releases whatever role this session held: a publisher close cascades
    // into its path closing its stream; a reader close just drops its
    // broadcast subscription, which the path never needs to know about.
    pub async fn on_conn_close(&self) {
        let mut inner = self.inner.lock().await;
        if let Role::Publisher { path, .. } = &inner.role {
            path.publisher_close(self.id).await;
        }
        inner.role = Role::None;
        inner.state = SessionState::Idle;
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_session_id_unique() {
        let live = Mutex::new(HashSet::new());
        let mut ids = HashSet::new();
        for _ in 0..1000 {
            let id = new_session_id(&live);
            assert!(id >= SESSION_ID_MIN);
            assert!(id < SESSION_ID_MIN + SESSION_ID_SPREAD);
            assert!(ids.insert(id));
        }
    }

    #[tokio::test]
    async fn test_setup_publish_without_announce_fails() {
        let manager = PathManager::new(CancellationToken::new());
        let session = Session::new(1, manager);
        let err = session.on_setup_publish(0).await.unwrap_err();
        assert_eq!(SetupError::PathNotExist, err);
    }

    #[tokio::test]
    async fn test_setup_publish_bad_track_index() {
        let manager = PathManager::new(CancellationToken::new());
        manager.add_path("cam1".to_owned()).await.unwrap();
        let session = Session::new(1, manager);
        session.on_announce("cam1").await.unwrap();
        let err = session.on_setup_publish(1).await.unwrap_err();
        assert_eq!(SetupError::TrackNotExist(1), err);
    }

    #[tokio::test]
    async fn test_setup_play_unknown_path() {
        let manager = PathManager::new(CancellationToken::new());
        let session = Session::new(1, manager);
        let err = session.on_setup_play("nope", 0).await.unwrap_err();
        assert_eq!(SetupError::PathNotExist, err);
    }
}
