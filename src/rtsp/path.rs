// SPDX-License-Identifier: GPL-2.0-or-later

use crate::avcc::{build_avcc, rfc6381_codec};
use crate::error::{DescribeError, PublisherAddError, ReaderAddError, WriteAccessUnitError};
use crate::sps::parse_dimensions;
use crate::stream::Stream;
use common::{TrackParameters, time::UnixH264};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;

// A stream can only be created once its track dimensions are known, which
// requires having seen a complete SPS/PPS pair from the publisher.
fn try_build_track_params(nals: &[Vec<u8>]) -> Option<TrackParameters> {
    let sps = nals
        .iter()
        .find(|n| n.first().is_some_and(|h| h & 0x1F == NAL_TYPE_SPS))?;
    let pps = nals
        .iter()
        .find(|n| n.first().is_some_and(|h| h & 0x1F == NAL_TYPE_PPS))?;
    let dims = parse_dimensions(sps)?;
    Some(TrackParameters {
        width: dims.width,
        height: dims.height,
        codec: rfc6381_codec(sps),
        extra_data: build_avcc(sps, pps),
    })
}

pub struct PathReader {
    pub track_params: TrackParameters,
    pub feed: tokio::sync::broadcast::Receiver<common::H264Data>,
}

enum Request {
    PublisherAdd {
        session_id: u64,
        reply: oneshot::Sender<Result<(), PublisherAddError>>,
    },
    PublisherWrite {
        session_id: u64,
        track_id: u8,
        nals: Vec<Vec<u8>>,
        pts: UnixH264,
        reply: oneshot::Sender<Result<(), WriteAccessUnitError>>,
    },
    PublisherClose {
        session_id: u64,
    },
    ReaderAdd {
        reply: oneshot::Sender<Result<PathReader, ReaderAddError>>,
    },
    Describe {
        reply: oneshot::Sender<Result<Arc<Stream>, DescribeError>>,
    },
}

// Handle to a single path's owning task. Every public operation is
// serialized through the request channel — the actor never performs I/O
// while mutating its state.
#[derive(Clone)]
pub struct Path {
    request_tx: mpsc::Sender<Request>,
}

struct PathState {
    publisher_session_id: Option<u64>,
    stream: Option<Arc<Stream>>,
}

impl Path {
    #[must_use]
    pub fn new(token: CancellationToken) -> Self {
        let (request_tx, mut request_rx) = mpsc::channel::<Request>(16);

        tokio::spawn(async move {
            let mut state = PathState {
                publisher_session_id: None,
                stream: None,
            };
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        return;
                    }
                    req = request_rx.recv() => {
                        let Some(req) = req else { return };
                        handle_request(&mut state, req);
                    }
                }
            }
        });

        Self { request_tx }
    }

    pub async fn publisher_add(&self, session_id: u64) -> Result<(), PublisherAddError> {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .request_tx
            .send(Request::PublisherAdd { session_id, reply })
            .await
            .is_err()
        {
            return Err(PublisherAddError::Closed);
        }
        reply_rx.await.unwrap_or(Err(PublisherAddError::Closed))
    }

    pub async fn publisher_write(
        &self,
        session_id: u64,
        track_id: u8,
        nals: Vec<Vec<u8>>,
        pts: UnixH264,
    ) -> Result<(), WriteAccessUnitError> {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .request_tx
            .send(Request::PublisherWrite {
                session_id,
                track_id,
                nals,
                pts,
                reply,
            })
            .await
            .is_err()
        {
            return Ok(());
        }
        reply_rx.await.unwrap_or(Ok(()))
    }

    pub async fn publisher_close(&self, session_id: u64) {
        _ = self.request_tx.send(Request::PublisherClose { session_id }).await;
    }

    pub async fn reader_add(&self) -> Result<PathReader, ReaderAddError> {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .request_tx
            .send(Request::ReaderAdd { reply })
            .await
            .is_err()
        {
            return Err(ReaderAddError::Closed);
        }
        reply_rx.await.unwrap_or(Err(ReaderAddError::Closed))
    }

    pub async fn describe(&self) -> Result<Arc<Stream>, DescribeError> {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .request_tx
            .send(Request::Describe { reply })
            .await
            .is_err()
        {
            return Err(DescribeError::Closed);
        }
        reply_rx.await.unwrap_or(Err(DescribeError::Closed))
    }
}

fn handle_request(state: &mut PathState, req: Request) {
    match req {
        Request::PublisherAdd { session_id, reply } => {
            let result = if state.publisher_session_id.is_some() {
                Err(PublisherAddError::Busy)
            } else {
                state.publisher_session_id = Some(session_id);
                Ok(())
            };
            _ = reply.send(result);
        }
        Request::PublisherWrite {
            session_id,
            track_id,
            nals,
            pts,
            reply,
        } => {
            let result = if state.publisher_session_id != Some(session_id) {
                Ok(())
            } else {
                if state.stream.is_none() {
                    if let Some(track_params) = try_build_track_params(&nals) {
                        state.stream = Some(Stream::new(track_params));
                    }
                }
                match &state.stream {
                    Some(stream) => stream.write_access_unit(track_id, nals, pts),
                    None => Ok(()),
                }
            };
            _ = reply.send(result);
        }
        Request::PublisherClose { session_id } => {
            if state.publisher_session_id == Some(session_id) {
                state.publisher_session_id = None;
                state.stream = None;
            }
        }
        Request::ReaderAdd { reply } => {
            let result = match &state.stream {
                Some(stream) => Ok(PathReader {
                    track_params: stream.track_params().clone(),
                    feed: stream.subscribe(),
                }),
                None => Err(ReaderAddError::NoOnePublishing),
            };
            _ = reply.send(result);
        }
        Request::Describe { reply } => {
            let result = state
                .stream
                .clone()
                .ok_or(DescribeError::NoOnePublishing);
            _ = reply.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SPS_1280X720: [u8; 9] = [0x67, 0x42, 0x00, 0x1f, 0xf8, 0x0a, 0x00, 0xb7, 0x00];
    const PPS: [u8; 2] = [0x68, 0xeb];

    #[tokio::test]
    async fn test_second_publisher_rejected_while_first_is_live() {
        let path = Path::new(CancellationToken::new());
        path.publisher_add(1).await.unwrap();
        assert_eq!(Err(PublisherAddError::Busy), path.publisher_add(2).await);
    }

    #[tokio::test]
    async fn test_reader_add_before_sps_pps_fails() {
        let path = Path::new(CancellationToken::new());
        path.publisher_add(1).await.unwrap();
        assert_eq!(
            Err(ReaderAddError::NoOnePublishing),
            path.reader_add().await.map(|_| ())
        );
    }

    #[tokio::test]
    async fn test_stream_created_once_sps_pps_seen() {
        let path = Path::new(CancellationToken::new());
        path.publisher_add(1).await.unwrap();
        path.publisher_write(
            1,
            0,
            vec![SPS_1280X720.to_vec(), PPS.to_vec()],
            UnixH264::from(0),
        )
        .await
        .unwrap();

        let reader = path.reader_add().await.unwrap();
        assert_eq!(1280, reader.track_params.width);
        assert_eq!(720, reader.track_params.height);
    }

    #[tokio::test]
    async fn test_publisher_close_drops_stream() {
        let path = Path::new(CancellationToken::new());
        path.publisher_add(1).await.unwrap();
        path.publisher_write(
            1,
            0,
            vec![SPS_1280X720.to_vec(), PPS.to_vec()],
            UnixH264::from(0),
        )
        .await
        .unwrap();
        path.publisher_close(1).await;
        assert_eq!(
            Err(DescribeError::NoOnePublishing),
            path.describe().await.map(|_| ())
        );
        assert_eq!(Ok(()), path.publisher_add(2).await);
    }
}
