// SPDX-License-Identifier: GPL-2.0-or-later

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendRequestError {
    #[error("canceled")]
    Canceled,

    #[error("client closed")]
    Closed,

    #[error("doods: {0}")]
    DoodsError(String),
}
