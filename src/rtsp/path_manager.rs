// SPDX-License-Identifier: GPL-2.0-or-later

use crate::error::{AddPathError, DescribeError, PublisherAddError, ReaderAddError};
use crate::path::{Path, PathReader};
use crate::stream::Stream;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

enum Request {
    AddPath {
        name: String,
        reply: oneshot::Sender<Result<(), AddPathError>>,
    },
    RemovePath {
        name: String,
    },
    PublisherAdd {
        name: String,
        session_id: u64,
        reply: oneshot::Sender<Result<Path, PublisherAddError>>,
    },
    ReaderAdd {
        name: String,
        reply: oneshot::Sender<Result<PathReader, ReaderAddError>>,
    },
    Describe {
        name: String,
        reply: oneshot::Sender<Result<Arc<Stream>, DescribeError>>,
    },
}

// Routes every publisher/reader operation to the `Path` actor addressed by
// name, creating paths on `AddPath` and tearing them down on `RemovePath`.
#[derive(Clone)]
pub struct PathManager {
    request_tx: mpsc::Sender<Request>,
}

impl PathManager {
    #[must_use]
    pub fn new(token: CancellationToken) -> Self {
        let (request_tx, mut request_rx) = mpsc::channel::<Request>(64);

        tokio::spawn(async move {
            let mut paths: HashMap<String, (Path, CancellationToken)> = HashMap::new();
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        for (_, path_token) in paths.into_values() {
                            path_token.cancel();
                        }
                        return;
                    }
                    req = request_rx.recv() => {
                        let Some(req) = req else { return };
                        handle_request(&token, &mut paths, req);
                    }
                }
            }
        });

        Self { request_tx }
    }

    pub async fn add_path(&self, name: String) -> Result<(), AddPathError> {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .request_tx
            .send(Request::AddPath { name, reply })
            .await
            .is_err()
        {
            return Ok(());
        }
        reply_rx.await.unwrap_or(Ok(()))
    }

    pub async fn remove_path(&self, name: String) {
        _ = self.request_tx.send(Request::RemovePath { name }).await;
    }

    pub async fn publisher_add(
        &self,
        name: String,
        session_id: u64,
    ) -> Result<Path, PublisherAddError> {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .request_tx
            .send(Request::PublisherAdd {
                name,
                session_id,
                reply,
            })
            .await
            .is_err()
        {
            return Err(PublisherAddError::Closed);
        }
        reply_rx.await.unwrap_or(Err(PublisherAddError::Closed))
    }

    pub async fn reader_add(&self, name: String) -> Result<PathReader, ReaderAddError> {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .request_tx
            .send(Request::ReaderAdd { name, reply })
            .await
            .is_err()
        {
            return Err(ReaderAddError::Closed);
        }
        reply_rx.await.unwrap_or(Err(ReaderAddError::Closed))
    }

    pub async fn describe(&self, name: String) -> Result<Arc<Stream>, DescribeError> {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .request_tx
            .send(Request::Describe { name, reply })
            .await
            .is_err()
        {
            return Err(DescribeError::Closed);
        }
        reply_rx.await.unwrap_or(Err(DescribeError::Closed))
    }
}

fn handle_request(
    parent_token: &CancellationToken,
    paths: &mut HashMap<String, (Path, CancellationToken)>,
    req: Request,
) {
    match req {
        Request::AddPath { name, reply } => {
            let result = if name.is_empty() {
                Err(AddPathError::InvalidName(name))
            } else if paths.contains_key(&name) {
                Err(AddPathError::AlreadyExists(name))
            } else {
                let path_token = parent_token.child_token();
                let path = Path::new(path_token.clone());
                paths.insert(name, (path, path_token));
                Ok(())
            };
            _ = reply.send(result);
        }
        Request::RemovePath { name } => {
            if let Some((_, path_token)) = paths.remove(&name) {
                path_token.cancel();
            }
        }
        Request::PublisherAdd {
            name,
            session_id,
            reply,
        } => {
            let Some((path, _)) = paths.get(&name) else {
                _ = reply.send(Err(PublisherAddError::Closed));
                return;
            };
            let path = path.clone();
            tokio::spawn(async move {
                let result = path.publisher_add(session_id).await.map(|()| path.clone());
                _ = reply.send(result);
            });
        }
        Request::ReaderAdd { name, reply } => {
            let Some((path, _)) = paths.get(&name) else {
                _ = reply.send(Err(ReaderAddError::NoOnePublishing));
                return;
            };
            let path = path.clone();
            tokio::spawn(async move {
                _ = reply.send(path.reader_add().await);
            });
        }
        Request::Describe { name, reply } => {
            let Some((path, _)) = paths.get(&name) else {
                _ = reply.send(Err(DescribeError::NotFound));
                return;
            };
            let path = path.clone();
            tokio::spawn(async move {
                _ = reply.send(path.describe().await);
            });
        }
    }
}
