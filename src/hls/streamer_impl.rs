// SPDX-License-Identifier: GPL-2.0-or-later

// Adapts `HlsServer` to the generic `StreamerImpl` muxer abstraction that the
// monitor source pipeline depends on, so the monitor crate never has to know
// it's talking to an HLS muxer specifically.

use crate::{H264Writer, HlsServer};
use async_trait::async_trait;
use common::{
    monitor::{DynH264Writer, H264WriterImpl, StreamerImpl},
    time::UnixH264,
    ArcStreamerMuxer, Cancelled, DynError, H264Data, MonitorId, TrackParameters,
};
use tokio_util::sync::CancellationToken;

pub struct HlsStreamer(HlsServer);

impl HlsStreamer {
    #[must_use]
    pub fn new(server: HlsServer) -> Self {
        Self(server)
    }
}

#[async_trait]
impl StreamerImpl for HlsStreamer {
    async fn new_muxer(
        &self,
        token: CancellationToken,
        monitor_id: MonitorId,
        sub_stream: bool,
        params: TrackParameters,
        _start_time: UnixH264,
        _first_sample: H264Data,
    ) -> Result<Option<(ArcStreamerMuxer, DynH264Writer)>, DynError> {
        let name = muxer_name(&monitor_id, sub_stream);
        match self.0.new_muxer(token, name, params).await {
            Ok((muxer, writer)) => {
                let writer: DynH264Writer = Box::new(HlsWriter(writer));
                Ok(Some((muxer, writer)))
            }
            Err(Cancelled) => Ok(None),
        }
    }
}

fn muxer_name(monitor_id: &MonitorId, sub_stream: bool) -> String {
    if sub_stream {
        format!("{monitor_id}_sub")
    } else {
        monitor_id.to_string()
    }
}

struct HlsWriter(H264Writer);

#[async_trait]
impl H264WriterImpl for HlsWriter {
    async fn write_h264(&mut self, data: H264Data) -> Result<(), DynError> {
        self.0
            .write_h264(data)
            .await
            .map_err(|e| Box::new(e) as DynError)
    }
}
