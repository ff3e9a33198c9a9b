// SPDX-License-Identifier: GPL-2.0-or-later

use crate::error::SendRequestError;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

const DIAL_TIMEOUT: Duration = Duration::from_secs(1);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_WARMUP: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    id: &'a str,
    detector_name: &'a str,
    data: String,
    detect: &'a HashMap<String, f32>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: String,
    #[serde(default)]
    detections: Vec<WireDetection>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct WireDetection {
    pub label: String,
    pub confidence: f32,
    pub top: f32,
    pub left: f32,
    pub bottom: f32,
    pub right: f32,
}

type ReplyTx = oneshot::Sender<Result<Vec<WireDetection>, SendRequestError>>;

enum Cmd {
    Detect {
        detector_name: String,
        data: Vec<u8>,
        detect: HashMap<String, f32>,
        reply_tx: ReplyTx,
    },
}

// A single reconnecting connection to a detection server, multiplexed
// across every caller via a monotonically increasing request id.
#[derive(Clone)]
pub struct DetectionClient {
    cmd_tx: mpsc::Sender<Cmd>,
}

impl DetectionClient {
    #[must_use]
    pub fn new(url: Url, token: CancellationToken) -> Self {
        Self::with_warmup(url, token, DEFAULT_WARMUP)
    }

    #[must_use]
    pub fn with_warmup(url: Url, token: CancellationToken, warmup: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        tokio::spawn(run(url, warmup, cmd_rx, token));
        Self { cmd_tx }
    }

    // Sends one frame for detection. Returns immediately with `Canceled`
    // if `cancel` fires before a reply arrives; does not wait for the
    // detector in that case.
    pub async fn detect(
        &self,
        detector_name: String,
        data: Vec<u8>,
        detect: HashMap<String, f32>,
        cancel: &CancellationToken,
    ) -> Result<Vec<WireDetection>, SendRequestError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Detect { detector_name, data, detect, reply_tx })
            .await
            .map_err(|_| SendRequestError::Closed)?;

        tokio::select! {
            () = cancel.cancelled() => Err(SendRequestError::Canceled),
            res = reply_rx => res.map_err(|_| SendRequestError::Closed)?,
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<String, ReplyTx>>>;

async fn run(url: Url, warmup: Duration, mut cmd_rx: mpsc::Receiver<Cmd>, token: CancellationToken) {
    if !warmup.is_zero() {
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(warmup) => {}
        }
    }

    let next_id = AtomicU64::new(1);

    loop {
        if token.is_cancelled() {
            return;
        }

        let ws = tokio::select! {
            () = token.cancelled() => return,
            res = connect(&url) => res,
        };

        let Ok(ws) = ws else {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
            continue;
        };

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (mut write, mut read) = ws.split();

        'conn: loop {
            tokio::select! {
                () = token.cancelled() => {
                    drain_pending(&pending).await;
                    return;
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => dispatch_reply(&pending, &text).await,
                        Some(Ok(Message::Binary(data))) => {
                            if let Ok(text) = String::from_utf8(data) {
                                dispatch_reply(&pending, &text).await;
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(_)) | None => break 'conn,
                    }
                }
                cmd = cmd_rx.recv() => {
                    let Some(Cmd::Detect { detector_name, data, detect, reply_tx }) = cmd else {
                        drain_pending(&pending).await;
                        return;
                    };
                    let id = next_id.fetch_add(1, Ordering::Relaxed).to_string();
                    pending.lock().await.insert(id.clone(), reply_tx);

                    let req = WireRequest {
                        id: &id,
                        detector_name: &detector_name,
                        data: base64::engine::general_purpose::STANDARD.encode(&data),
                        detect: &detect,
                    };
                    let Ok(text) = serde_json::to_string(&req) else {
                        if let Some(tx) = pending.lock().await.remove(&id) {
                            let _ = tx.send(Err(SendRequestError::Closed));
                        }
                        continue;
                    };
                    if write.send(Message::Text(text)).await.is_err() {
                        break 'conn;
                    }
                }
            }
        }

        drain_pending(&pending).await;
    }
}

async fn connect(url: &Url) -> Result<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>, ()> {
    tokio::time::timeout(DIAL_TIMEOUT, tokio_tungstenite::connect_async(url.as_str()))
        .await
        .map_err(|_| ())?
        .map(|(ws, _)| ws)
        .map_err(|_| ())
}

async fn dispatch_reply(pending: &PendingMap, text: &str) {
    let Ok(resp) = serde_json::from_str::<WireResponse>(text) else {
        return;
    };
    let Some(tx) = pending.lock().await.remove(&resp.id) else {
        return;
    };
    let result = match resp.error {
        Some(err) => Err(SendRequestError::DoodsError(err)),
        None => Ok(resp.detections),
    };
    let _ = tx.send(result);
}

async fn drain_pending(pending: &PendingMap) {
    for (_, tx) in pending.lock().await.drain() {
        let _ = tx.send(Err(SendRequestError::Closed));
    }
}
