// SPDX-License-Identifier: GPL-2.0-or-later

use crate::avcc::build_avcc;
use crate::error::WriteAccessUnitError;
use common::{
    H264Data, PaddedBytes, TrackParameters,
    time::{DtsOffset, UnixH264},
};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

pub const VIDEO_TRACK_ID: u8 = 0;

const NAL_TYPE_SLICE_IDR: u8 = 5;
const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;
const NAL_TYPE_AUD: u8 = 9;

// Track-aware view of a single publisher's stream: caches the latest
// SPS/PPS, remuxes every access unit (AUD and parameter sets dropped from
// the delivered unit, IDRs reprefixed with SPS+PPS) and fans the result out
// to every reader without blocking the publisher.
pub struct Stream {
    track_params: TrackParameters,
    params_cache: Mutex<ParamsCache>,
    readers: broadcast::Sender<H264Data>,
}

#[derive(Default)]
struct ParamsCache {
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl Stream {
    #[must_use]
    pub fn new(track_params: TrackParameters) -> Arc<Self> {
        let (readers, _) = broadcast::channel(100);
        Arc::new(Self {
            track_params,
            params_cache: Mutex::new(ParamsCache::default()),
            readers,
        })
    }

    #[must_use]
    pub fn track_params(&self) -> &TrackParameters {
        &self.track_params
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<H264Data> {
        self.readers.subscribe()
    }

    // Accepts one decoded access unit for `track_id` and, once remuxed,
    // delivers it to every current subscriber.
    pub fn write_access_unit(
        &self,
        track_id: u8,
        nals: Vec<Vec<u8>>,
        pts: UnixH264,
    ) -> Result<(), WriteAccessUnitError> {
        if track_id != VIDEO_TRACK_ID {
            return Err(WriteAccessUnitError::UnknownTrack(track_id));
        }

        let mut cache = self.params_cache.lock().expect("lock not poisoned");
        let mut is_idr = false;
        let mut out: Vec<Vec<u8>> = Vec::with_capacity(nals.len() + 2);
        for nal in nals {
            let Some(&header) = nal.first() else { continue };
            match header & 0x1F {
                NAL_TYPE_SPS => cache.sps = Some(nal),
                NAL_TYPE_PPS => cache.pps = Some(nal),
                NAL_TYPE_AUD => {}
                NAL_TYPE_SLICE_IDR => {
                    is_idr = true;
                    out.push(nal);
                }
                _ => out.push(nal),
            }
        }

        if is_idr {
            if let (Some(pps), Some(sps)) = (cache.pps.clone(), cache.sps.clone()) {
                out.splice(0..0, [sps, pps]);
            }
        }
        drop(cache);

        let avcc = avcc_from_nals(&out);
        let data = H264Data {
            pts,
            dts_offset: DtsOffset::new(0),
            avcc: Arc::new(PaddedBytes::new(avcc)),
            random_access_present: is_idr,
        };
        _ = self.readers.send(data);
        Ok(())
    }

    // Called once the publisher has sent its first SPS/PPS, for building
    // the AVCDecoderConfigurationRecord ahead of the first IDR if needed.
    pub fn set_parameter_sets(&self, sps: Vec<u8>, pps: Vec<u8>) {
        let mut cache = self.params_cache.lock().expect("lock not poisoned");
        cache.sps = Some(sps);
        cache.pps = Some(pps);
    }
}

fn avcc_from_nals(nals: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for nal in nals {
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out
}

#[must_use]
pub fn extra_data_from_sps_pps(sps: &[u8], pps: &[u8]) -> Vec<u8> {
    build_avcc(sps, pps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn track_params() -> TrackParameters {
        TrackParameters {
            width: 1920,
            height: 1080,
            codec: "avc1.640028".to_owned(),
            extra_data: vec![],
        }
    }

    #[test]
    fn test_write_unknown_track() {
        let stream = Stream::new(track_params());
        let err = stream
            .write_access_unit(1, vec![vec![0x41]], UnixH264::from(0))
            .unwrap_err();
        assert_eq!(WriteAccessUnitError::UnknownTrack(1), err);
    }

    #[tokio::test]
    async fn test_idr_gets_prefixed_with_sps_pps() {
        let stream = Stream::new(track_params());
        let mut rx = stream.subscribe();

        let sps = vec![0x67, 1, 2, 3];
        let pps = vec![0x68, 1];
        stream
            .write_access_unit(VIDEO_TRACK_ID, vec![sps.clone(), pps.clone()], 0.into())
            .unwrap();
        // Parameter sets alone don't constitute a deliverable access unit's
        // video payload but are still cached and broadcast (empty avcc).
        let first = rx.recv().await.unwrap();
        assert!(!first.random_access_present);

        let idr = vec![0x65, 0xAA];
        stream
            .write_access_unit(VIDEO_TRACK_ID, vec![idr.clone()], 1.into())
            .unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second.random_access_present);
    }

    #[tokio::test]
    async fn test_aud_dropped() {
        let stream = Stream::new(track_params());
        let mut rx = stream.subscribe();
        let slice = vec![0x41, 0xAA];
        stream
            .write_access_unit(VIDEO_TRACK_ID, vec![vec![0x09, 0xF0], slice.clone()], 0.into())
            .unwrap();
        let data = rx.recv().await.unwrap();
        assert_eq!(&(slice.len() as u32).to_be_bytes()[..], &data.avcc[..4]);
    }
}
