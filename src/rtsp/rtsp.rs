// SPDX-License-Identifier: GPL-2.0-or-later

mod avcc;
mod error;
mod path;
mod path_manager;
mod rtp;
mod server;
mod session;
mod sps;
mod stream;

pub use avcc::{build_avcc, rfc6381_codec};
pub use error::{
    AddPathError, DescribeError, PublisherAddError, ReaderAddError, SetupError,
    WriteAccessUnitError,
};
pub use path::{Path, PathReader};
pub use path_manager::PathManager;
pub use rtp::{parse_rtp_header, H264Depacketizer, ParseRtpError, RtpHeader};
pub use server::{pts_from_rtp_timestamp, rtp_seq_and_ts, RtspServer};
pub use session::{new_session_id, Session, SessionState};
pub use sps::{parse_dimensions, SpsDimensions};
pub use stream::{extra_data_from_sps_pps, Stream, VIDEO_TRACK_ID};
