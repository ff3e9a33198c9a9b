// SPDX-License-Identifier: GPL-2.0-or-later

use crate::log_monitor;
use async_trait::async_trait;
use common::{
    ArcLogger, ArcMsgLogger, ArcStreamerMuxer, H264Data, LogEntry, LogLevel, MonitorId, MsgLogger,
    StreamType,
    monitor::{
        ArcStreamer, DecoderError, DynH264Writer, Feed, FeedDecoded, SourceRtspConfig, Source,
        SubscribeDecodedError,
    },
    recording::FrameRateLimiter,
    time::UnixNano,
};
use rtsp::{PathManager, ReaderAddError};
use sentryshot_convert::Frame;
use sentryshot_ffmpeg_h264::{
    H264Decoder, H264DecoderBuilder, Packet, PaddedBytes, Ready, ReceiveFrameError, SendPacketError,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::{broadcast, mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;

#[allow(clippy::module_name_repetitions)]
pub struct MonitorSource {
    stream_type: StreamType,
    get_muxer_tx: mpsc::Sender<oneshot::Sender<ArcStreamerMuxer>>,
    subscribe_tx: mpsc::Sender<oneshot::Sender<Feed>>,
}

impl MonitorSource {
    #[must_use]
    pub fn new(
        stream_type: StreamType,
        get_muxer_tx: mpsc::Sender<oneshot::Sender<ArcStreamerMuxer>>,
        subscribe_tx: mpsc::Sender<oneshot::Sender<Feed>>,
    ) -> Self {
        Self {
            stream_type,
            get_muxer_tx,
            subscribe_tx,
        }
    }
}

#[async_trait]
impl Source for MonitorSource {
    #[must_use]
    fn stream_type(&self) -> &StreamType {
        &self.stream_type
    }

    // Returns the HLS muxer for this source. Will block until the source has started.
    // Returns None if cancelled.
    async fn muxer(&self) -> Option<ArcStreamerMuxer> {
        let (res_tx, res_rx) = oneshot::channel();
        if self.get_muxer_tx.send(res_tx).await.is_err() {
            return None;
        }
        let Ok(muxer) = res_rx.await else {
            return None;
        };
        Some(muxer)
    }

    // Subscribe to the raw feed. Will block until the source has started.
    async fn subscribe(&self) -> Option<Feed> {
        let (res_tx, res_rx) = oneshot::channel();
        if self.subscribe_tx.send(res_tx).await.is_err() {
            return None;
        }
        let Ok(feed) = res_rx.await else {
            return None;
        };
        Some(feed)
    }

    // Subscribe to a decoded feed. Currently creates a new decoder for each
    // call but this may change. Will block until the source has started.
    // Will close channel when cancelled.
    async fn subscribe_decoded(
        &self,
        rt_handle: Handle,
        logger: ArcMsgLogger,
        limiter: Option<FrameRateLimiter>,
    ) -> Option<Result<FeedDecoded, SubscribeDecodedError>> {
        let feed = self.subscribe().await?;

        // We could grab the extradata strait from the source instead.
        let muxer = self.muxer().await?;
        let extradata = muxer.params().extra_data.clone();

        let h264_decoder = match H264DecoderBuilder::new().avcc(PaddedBytes::new(extradata)) {
            Ok(v) => v,
            Err(e) => return Some(Err(SubscribeDecodedError::NewH264Decoder(e))),
        };
        Some(Ok(new_decoder(
            rt_handle,
            logger,
            feed,
            h264_decoder,
            limiter,
        )))
    }
}

struct SourceLogger {
    logger: ArcLogger,

    monitor_id: MonitorId,
    source_name: String,
    stream_type: StreamType,
}

impl SourceLogger {
    fn new(
        logger: ArcLogger,
        monitor_id: MonitorId,
        source_name: String,
        stream_type: StreamType,
    ) -> Self {
        Self {
            logger,
            monitor_id,
            source_name,
            stream_type,
        }
    }
}

impl MsgLogger for SourceLogger {
    fn log(&self, level: LogLevel, msg: &str) {
        self.logger.log(LogEntry::new(
            level,
            "monitor",
            &self.monitor_id,
            &format!(
                "({}) {} source: {}",
                self.stream_type.name(),
                self.source_name,
                msg
            ),
        ));
    }
}

// Drives a monitor's feed from the embedded RTSP path manager instead of
// dialing out to the camera: an external transcoder publishes into the
// path named after this stream, and this source only ever reads from it.
#[allow(clippy::module_name_repetitions)]
pub struct SourcePathManager {
    msg_logger: ArcMsgLogger,
    streamer: ArcStreamer,
    path_manager: PathManager,

    monitor_id: MonitorId,
    path_name: String,
    stream_type: StreamType,
}

impl SourcePathManager {
    #[allow(clippy::new_ret_no_self, clippy::too_many_arguments)]
    pub fn new(
        token: CancellationToken,
        shutdown_complete_tx: mpsc::Sender<()>,
        logger: ArcLogger,
        streamer: ArcStreamer,
        path_manager: PathManager,
        monitor_id: MonitorId,
        config: SourceRtspConfig,
        stream_type: StreamType,
    ) -> Option<MonitorSource> {
        if stream_type.is_sub() && config.sub_stream.is_none() {
            log_monitor(&logger, LogLevel::Debug, &monitor_id, "no sub stream");
            return None;
        }

        let path_name = path_name_from_config(&monitor_id, &config, stream_type);

        let msg_logger = Arc::new(SourceLogger::new(
            logger,
            monitor_id.clone(),
            "rtsp".to_owned(),
            stream_type,
        ));

        let source = Self {
            msg_logger,
            streamer,
            path_manager,
            monitor_id,
            path_name,
            stream_type,
        };

        let (started_tx, mut started_rx) = mpsc::channel(1);

        let shutdown_complete_tx2 = shutdown_complete_tx.clone();
        let token2 = token.clone();
        tokio::spawn(async move {
            let _shutdown_complete = shutdown_complete_tx2;
            loop {
                if token2.is_cancelled() {
                    source.log(LogLevel::Info, "stopped");
                    return;
                }

                match source.run(token2.child_token(), started_tx.clone()).await {
                    Ok(()) => source.log(LogLevel::Debug, "cancelled"),
                    Err(e) => source.log(LogLevel::Error, &format!("crashed: {e}")),
                };

                tokio::select! {
                    () = token2.cancelled() => {}
                    () = tokio::time::sleep(tokio::time::Duration::from_secs(10)) => {}
                }
            }
        });

        let (get_muxer_tx, mut get_muxer_rx) =
            mpsc::channel::<oneshot::Sender<ArcStreamerMuxer>>(1);
        let (subscribe_tx, mut subscribe_rx) = mpsc::channel::<oneshot::Sender<Feed>>(1);

        tokio::spawn(async move {
            let _shutdown_complete = shutdown_complete_tx;
            let mut muxer = None;
            let mut feed_tx = None;
            let mut get_muxer_requests: Vec<oneshot::Sender<_>> = Vec::new();
            let mut subscribe_requests: Vec<oneshot::Sender<_>> = Vec::new();
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                   res = started_rx.recv() => {
                        let Some((m, f)) = res else {
                            return
                        };
                        while let Some(res) = get_muxer_requests.pop() {
                            _ = res.send(m.clone());
                        }
                        while let Some(res) = subscribe_requests.pop() {
                            _ = res.send(f.subscribe());
                        }
                        muxer = Some(m);
                        feed_tx = Some(f);
                    }

                    res = get_muxer_rx.recv() => {
                        let Some(res) = res else {
                            return
                        };
                        if let Some(muxer) = &muxer {
                            _ = res.send(muxer.clone());
                        } else {
                            get_muxer_requests.push(res);
                        }
                    }
                    res = subscribe_rx.recv() => {
                        let Some(res) = res else {
                            return
                        };
                        if let Some(feed_tx) = &feed_tx {
                            _ = res.send(feed_tx.subscribe());
                        } else {
                            subscribe_requests.push(res);
                        }
                    }
                }
            }
        });

        Some(MonitorSource::new(stream_type, get_muxer_tx, subscribe_tx))
    }

    fn log(&self, level: LogLevel, msg: &str) {
        self.msg_logger.log(level, msg);
    }

    async fn run(
        &self,
        token: CancellationToken,
        started_tx: mpsc::Sender<(ArcStreamerMuxer, broadcast::Sender<H264Data>)>,
    ) -> Result<(), SourcePathManagerRunError> {
        use SourcePathManagerRunError::{NewMuxer, ReaderAdd};

        let reader = self
            .path_manager
            .reader_add(self.path_name.clone())
            .await
            .map_err(ReaderAdd)?;

        // Buffer 10 frames to reduce dropped frames.
        let (feed_tx, _) = broadcast::channel(10);
        let mut upstream = reader.feed;
        let mut stream_started: Option<DynH264Writer> = None;

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    return Ok(());
                },
                data = upstream.recv() => {
                    let data = match data {
                        Ok(v) => v,
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    };

                    if let Some(hls_writer) = &mut stream_started {
                        hls_writer.write_h264(data.clone()).await
                            .map_err(SourcePathManagerRunError::WriteH264)?;
                        _ = feed_tx.send(data);
                    } else {
                        if !data.random_access_present {
                            continue;
                        }
                        let start_time = UnixNano::now();
                        let result = self.streamer.new_muxer(
                            token.clone(),
                            self.monitor_id.clone(),
                            self.stream_type.is_sub(),
                            reader.track_params.clone(),
                            start_time.into(),
                            data.clone(),
                        )
                            .await
                            .map_err(NewMuxer)?;
                        let Some((muxer, hls_writer)) = result else {
                            // Cancelled.
                            return Ok(());
                        };
                        stream_started = Some(hls_writer);
                        _ = started_tx.send((muxer, feed_tx.clone())).await;
                    }
                }
            }
        }
    }
}

fn path_name_from_config(
    monitor_id: &MonitorId,
    config: &SourceRtspConfig,
    stream_type: StreamType,
) -> String {
    let url = if stream_type.is_main() {
        &config.main_stream
    } else {
        config
            .sub_stream
            .as_ref()
            .expect("sub_stream to be `Some`")
    };
    url.path_segments()
        .and_then(Iterator::last)
        .filter(|s| !s.is_empty())
        .map_or_else(
            || format!("{monitor_id}_{}", stream_type.name()),
            ToOwned::to_owned,
        )
}

#[derive(Debug, Error)]
enum SourcePathManagerRunError {
    #[error("add reader: {0}")]
    ReaderAdd(ReaderAddError),

    #[error("write h264: {0}")]
    WriteH264(common::DynError),

    #[error("new muxer: {0}")]
    NewMuxer(common::DynError),
}

fn new_decoder(
    rt_handle: Handle,
    logger: ArcMsgLogger,
    mut feed: Feed,
    mut h264_decoder: H264Decoder<Ready>,
    mut frame_rate_limiter: Option<FrameRateLimiter>,
) -> FeedDecoded {
    let (frame_tx, frame_rx) = mpsc::channel(1);

    rt_handle.clone().spawn(async move {
        use DecoderError::{DroppedFrames, FrameRateLimiter, ReceiveFrame, SendFrame, TryFrom};
        loop {
            use broadcast::error::RecvError;
            let frame = match feed.recv().await {
                Ok(v) => v,
                Err(RecvError::Closed) => {
                    // Close receiver by dropping sender.
                    return;
                }
                Err(RecvError::Lagged(_)) => {
                    _ = frame_tx.send(Err(DroppedFrames)).await;
                    return;
                }
            };

            // State juggling to avoid lifetime issue.
            let avcc = frame.avcc.clone();

            let result: Result<(), SendPacketError>;
            (h264_decoder, result) = rt_handle
                .spawn_blocking(move || {
                    let result = h264_decoder.send_packet(&Packet::new(&avcc).with_pts(*frame.pts));
                    (h264_decoder, result)
                })
                .await
                .expect("join");
            if let Err(e) = result {
                if let SendPacketError::Invaliddata = e {
                    logger.log(LogLevel::Warning, "h264 decoder: send_packet: invalid data");
                    continue;
                }
                _ = frame_tx.send(Err(SendFrame(e))).await;
                return;
            };

            loop {
                let mut frame_decoded = Frame::new();
                match h264_decoder.receive_frame(&mut frame_decoded) {
                    Ok(()) => {}
                    Err(ReceiveFrameError::Eagain) => break,
                    Err(e) => {
                        _ = frame_tx.send(Err(ReceiveFrame(e))).await;
                        return;
                    }
                };
                let pts = match u64::try_from(frame_decoded.pts()) {
                    Ok(v) => v,
                    Err(e) => {
                        _ = frame_tx.send(Err(TryFrom(e))).await;
                        return;
                    }
                };

                let discard = if let Some(limiter) = &mut frame_rate_limiter {
                    match limiter.discard(pts) {
                        Ok(v) => v,
                        Err(e) => {
                            _ = frame_tx.send(Err(FrameRateLimiter(e))).await;
                            return;
                        }
                    }
                } else {
                    false
                };
                if !discard {
                    _ = frame_tx.send(Ok(frame_decoded)).await;
                }
            }
        }
    });

    frame_rx
}
