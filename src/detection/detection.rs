// SPDX-License-Identifier: GPL-2.0-or-later

pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod hooks;
pub mod pipeline;

pub use catalog::{DetectorInfo, FetchCatalogError, fetch_catalog};
pub use client::{DetectionClient, WireDetection};
pub use config::{Crop, DetectorName, DoodsConfig, Mask, Percent, Thresholds};
pub use error::SendRequestError;
pub use hooks::DetectionHooks;
pub use pipeline::{
    CalculateOutputsError, EncodePngError, Inputs, Outputs, ParseDetectionsError,
    ProcessFrameError, Uncrop, calculate_outputs, encode_png, parse_detections, process_frame,
};
