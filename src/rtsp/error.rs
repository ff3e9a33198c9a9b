// SPDX-License-Identifier: GPL-2.0-or-later

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddPathError {
    #[error("path '{0}' already exists")]
    AlreadyExists(String),

    #[error("invalid path name '{0}'")]
    InvalidName(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublisherAddError {
    #[error("path is busy")]
    Busy,

    #[error("path is closing")]
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReaderAddError {
    #[error("no one is publishing to this path")]
    NoOnePublishing,

    #[error("path is closing")]
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescribeError {
    #[error("no one is publishing to this path")]
    NoOnePublishing,

    #[error("path does not exist")]
    NotFound,

    #[error("path is closing")]
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WriteAccessUnitError {
    #[error("unknown track id {0}")]
    UnknownTrack(u8),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SetupError {
    #[error("track {0} does not exist")]
    TrackNotExist(usize),

    #[error("path does not exist")]
    PathNotExist,
}
