// SPDX-License-Identifier: GPL-2.0-or-later

mod cache;
mod mp4_muxer;
mod video;
mod video_reader;

pub use cache::VideoCache;
pub use hls::VIDEO_TRACK_ID;
pub use mp4_muxer::{GenerateMp4Error, Mp4Muxer, generate_mp4};
pub use video::{
    CreateVideoWriterError, HeaderFromReaderError, MetaHeader, MetaReader, ReadMetaError, Sample,
    TrackParameters, VideoWriter, WriteSampleError, read_meta,
};
pub use video_reader::{CreateVideoReaderError, new_video_reader};
