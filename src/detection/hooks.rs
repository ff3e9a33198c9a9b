// SPDX-License-Identifier: GPL-2.0-or-later

// Drives the detection loop for every monitor: parses its config, pulls
// decoded frames off the source, sends them to a detection server and
// triggers the monitor when something matches.

use crate::{
    catalog::DetectorInfo,
    client::DetectionClient,
    config::DoodsConfig,
    pipeline::{
        CalculateOutputsError, EncodePngError, Inputs, ParseDetectionsError, ProcessFrameError,
        calculate_outputs, encode_png, parse_detections, process_frame,
    },
};
use async_trait::async_trait;
use common::{
    ArcLogger, ArcMsgLogger, DynError, Event, LogEntry, LogLevel, MonitorConfig, MonitorId,
    MsgLogger,
    monitor::{
        ArcMonitor, ArcSource, CreateEventDbError, DecoderError, MonitorHooks, SubscribeDecodedError,
    },
    recording::FrameRateLimiter,
    time::UnixNano,
};
use sentryshot_util::Frame;
use std::{collections::HashMap, num::NonZeroU16, sync::Arc, time::Duration as StdDuration};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

const RETRY_DELAY: StdDuration = StdDuration::from_secs(3);

pub struct DetectionHooks {
    client: DetectionClient,
    catalog: HashMap<String, DetectorInfo>,
    rt_handle: Handle,
    logger: ArcLogger,
}

impl DetectionHooks {
    #[must_use]
    pub fn new(
        client: DetectionClient,
        catalog: Vec<DetectorInfo>,
        rt_handle: Handle,
        logger: ArcLogger,
    ) -> Self {
        Self {
            client,
            catalog: catalog.into_iter().map(|d| (d.name.clone(), d)).collect(),
            rt_handle,
            logger,
        }
    }
}

#[derive(Debug, Error)]
enum StartError {
    #[error("parse config: {0}")]
    ParseConfig(#[from] serde_json::Error),

    #[error("unknown detector '{0}'")]
    UnknownDetector(String),

    #[error("failed to get sub-stream")]
    GetSubStream,
}

#[derive(Debug, Error)]
enum RunError {
    #[error("subscribe: {0}")]
    Subscribe(#[from] SubscribeDecodedError),

    #[error("decoder: {0}")]
    Decoder(#[from] DecoderError),

    #[error("input size zero")]
    InputSizeZero,

    #[error("try from: {0}")]
    TryFrom(#[from] std::num::TryFromIntError),

    #[error("calculate outputs: {0}")]
    CalculateOutputs(#[from] CalculateOutputsError),

    #[error("process frame: {0}")]
    ProcessFrame(#[from] ProcessFrameError),

    #[error("encode png: {0}")]
    EncodePng(#[from] EncodePngError),

    #[error("detect: {0}")]
    Detect(#[from] crate::error::SendRequestError),

    #[error("parse detections: {0}")]
    ParseDetections(#[from] ParseDetectionsError),

    #[error("trigger: {0}")]
    Trigger(#[from] CreateEventDbError),
}

#[async_trait]
impl MonitorHooks for DetectionHooks {
    async fn on_monitor_start(&self, token: CancellationToken, monitor: ArcMonitor) {
        let msg_logger: ArcMsgLogger = Arc::new(DetectionMsgLogger {
            logger: self.logger.clone(),
            monitor_id: monitor.config().id().clone(),
        });

        if let Err(e) = self.start(&token, msg_logger.clone(), monitor).await {
            msg_logger.log(LogLevel::Error, &format!("start: {e}"));
        }
    }

    fn on_thumb_save(&self, _config: &MonitorConfig, frame: Frame) -> Frame {
        frame
    }

    async fn on_event(&self, _event: Event, _config: MonitorConfig) {}

    fn migrate_monitor(&self, _config: &mut serde_json::Value) -> Result<(), DynError> {
        Ok(())
    }
}

impl DetectionHooks {
    async fn start(
        &self,
        token: &CancellationToken,
        msg_logger: ArcMsgLogger,
        monitor: ArcMonitor,
    ) -> Result<(), StartError> {
        use StartError::{GetSubStream, UnknownDetector};

        let Some(config) = DoodsConfig::parse(monitor.config().raw())? else {
            // Detection is disabled for this monitor.
            return Ok(());
        };

        let source = if config.use_sub_stream {
            match monitor.source_sub().await {
                Some(Some(v)) => v,
                Some(None) => return Err(GetSubStream),
                None => return Ok(()), // Cancelled.
            }
        } else {
            match monitor.source_main().await {
                Some(v) => v,
                None => return Ok(()), // Cancelled.
            }
        };

        let detector = self
            .catalog
            .get(config.detector_name.as_str())
            .cloned()
            .ok_or_else(|| UnknownDetector(config.detector_name.to_string()))?;

        loop {
            msg_logger.log(LogLevel::Debug, "run");
            if let Err(e) = self.run(token, &msg_logger, &monitor, &config, &source, &detector).await {
                msg_logger.log(LogLevel::Error, &format!("run: {e}"));
            }

            let sleep = || {
                let _enter = self.rt_handle.enter();
                tokio::time::sleep(RETRY_DELAY)
            };
            tokio::select! {
                () = token.cancelled() => return Ok(()),
                () = sleep() => {}
            }
        }
    }

    async fn run(
        &self,
        token: &CancellationToken,
        msg_logger: &ArcMsgLogger,
        monitor: &ArcMonitor,
        config: &DoodsConfig,
        source: &ArcSource,
        detector: &DetectorInfo,
    ) -> Result<(), RunError> {
        use RunError::InputSizeZero;

        let Some(muxer) = source.muxer().await else {
            return Ok(()); // Cancelled.
        };
        let params = muxer.params();

        let inputs = Inputs {
            input_width: NonZeroU16::new(params.width).ok_or(InputSizeZero)?,
            input_height: NonZeroU16::new(params.height).ok_or(InputSizeZero)?,
            output_width: detector.width,
            output_height: detector.height,
        };
        let (outputs, uncrop) = calculate_outputs(config.crop, &inputs)?;
        let outputs = Arc::new(outputs);

        let feed_rate_nanos = i64::try_from(config.feed_rate.as_nanos()).unwrap_or(i64::MAX);
        let feed_rate = common::time::Duration::from_nanos(feed_rate_nanos);
        let rate_limiter = FrameRateLimiter::new(u64::try_from(*feed_rate.as_h264())?);

        let Some(feed) = source
            .subscribe_decoded(self.rt_handle.clone(), msg_logger.clone(), Some(rate_limiter))
            .await
        else {
            return Ok(()); // Cancelled.
        };
        let mut feed = feed?;

        let gray = config.is_gray_detector();

        loop {
            let Some(frame) = feed.recv().await else {
                return Ok(()); // Feed was cancelled.
            };
            let frame = frame?;
            let time = UnixNano::now();

            let outputs_for_blocking = outputs.clone();
            let processed = self
                .rt_handle
                .spawn_blocking(move || process_frame(&outputs_for_blocking, frame, gray))
                .await
                .expect("join")?;
            let png = encode_png(&processed, inputs.output_width, inputs.output_height)?;

            let raw = self
                .client
                .detect(
                    config.detector_name.to_string(),
                    png,
                    thresholds_as_map(&config.thresholds),
                    token,
                )
                .await?;
            let detections = parse_detections(&config.thresholds, &config.mask, &outputs, &uncrop, raw)?;

            let Some(d) = detections.first() else {
                continue;
            };
            msg_logger.log(
                LogLevel::Debug,
                &format!("trigger: label:{} score:{:.1}", d.label, d.score),
            );

            monitor
                .trigger(
                    common::time::Duration::from_nanos(
                        i64::try_from(config.trigger_duration.as_nanos()).unwrap_or(i64::MAX),
                    ),
                    Event {
                        time,
                        duration: feed_rate,
                        rec_duration: common::time::Duration::default(),
                        detections,
                    },
                )
                .await?;
        }
    }
}

fn thresholds_as_map(thresholds: &crate::config::Thresholds) -> HashMap<String, f32> {
    thresholds
        .iter()
        .map(|(label, pct)| (label.to_string(), pct.as_f32()))
        .collect()
}

struct DetectionMsgLogger {
    logger: ArcLogger,
    monitor_id: MonitorId,
}

impl MsgLogger for DetectionMsgLogger {
    fn log(&self, level: LogLevel, msg: &str) {
        self.logger.log(LogEntry::new(
            level,
            "detection",
            Some(self.monitor_id.clone()),
            msg.to_owned(),
        ));
    }
}
