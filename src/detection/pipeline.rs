// SPDX-License-Identifier: GPL-2.0-or-later

use crate::client::WireDetection;
use crate::config::{Crop, Mask, Thresholds};
use common::{Detection, Detections, Label, Region, RectangleNormalized};
use common::recording::vertex_inside_poly2;
use sentryshot_convert::{ConvertError, Frame, NewConverterError, PixelFormat, PixelFormatConverter};
use sentryshot_filter::{CropError, PadError, crop, pad};
use sentryshot_scale::{CreateScalerError, Scaler, ScalerError};
use sentryshot_util::ImageCopyToBufferError;
use std::num::{NonZeroU16, NonZeroU32, TryFromIntError};
use thiserror::Error;

#[derive(Debug)]
pub struct Inputs {
    pub input_width: NonZeroU16,
    pub input_height: NonZeroU16,
    pub output_width: NonZeroU16,
    pub output_height: NonZeroU16,
}

#[derive(Debug)]
pub struct Outputs {
    padded_width: NonZeroU16,
    padded_height: NonZeroU16,
    scaled_width: NonZeroU16,
    scaled_height: NonZeroU16,
    crop_x: u16,
    crop_y: u16,
    output_width: NonZeroU16,
    output_height: NonZeroU16,
    output_size: usize,
}

type UncropFn = Box<dyn Fn(u32) -> u32 + Send + Sync>;

pub struct Uncrop {
    uncrop_x_fn: UncropFn,
    uncrop_y_fn: UncropFn,
}

#[derive(Debug, Error)]
pub enum CalculateOutputsError {
    #[error("input width is less than output width, {0}/{1}")]
    OutputWidth(u32, u32),

    #[error("input height is less than output height, {0}/{1}")]
    OutputHeight(u32, u32),

    #[error("cropSize={0}% is less than {1}%")]
    CropSizeTooSmall(u32, u32),

    #[error("input width is less than scaled width, {0}/{1}")]
    ScaledWidth(u16, f64),

    #[error("try from int: {0}")]
    TryFromInt(#[from] TryFromIntError),

    #[error("zero")]
    Zero,
}

// Derives the scale/pad/crop plan that maps an arbitrarily-sized input
// frame onto the detector's fixed input dimensions, plus the inverse
// mapping used to rewrite detection rectangles back into input-space.
#[allow(clippy::items_after_statements, clippy::similar_names)]
pub fn calculate_outputs(
    crop: Crop,
    i: &Inputs,
) -> Result<(Outputs, Uncrop), CalculateOutputsError> {
    use CalculateOutputsError::{
        CropSizeTooSmall, OutputHeight, OutputWidth, ScaledWidth, Zero,
    };
    let crop_x = u32::from(crop.x);
    let crop_y = u32::from(crop.y);
    let crop_size = crop.size;
    let input_width = u32::from(i.input_width.get());
    let input_height = u32::from(i.input_height.get());
    let output_width = i.output_width.get();
    let output_height = i.output_height.get();
    let output_width2 = u32::from(output_width);
    let output_height2 = u32::from(output_height);

    if input_width < output_width2 {
        return Err(OutputWidth(input_width, output_width2));
    }
    if i.input_height.get() < output_height {
        return Err(OutputHeight(input_height, output_height2));
    }

    let padded_width = u16::try_from(output_width2 * 100 / crop_size)?;
    let padded_width2 = u32::from(padded_width);

    let padded_height = u16::try_from(output_height2 * 100 / crop_size)?;
    let padded_height2 = u32::from(padded_height);

    let crop_out_x = u16::try_from(padded_width2 * crop_x / 100)?;
    let crop_out_y = u16::try_from(padded_height2 * crop_y / 100)?;

    let width_ratio = input_width * output_height2;
    let height_ratio = input_height * output_width2;

    let mut scaled_width = padded_width;
    let mut scaled_height = padded_height;

    let mut padding_x_multiplier: u64 = 10000;
    let mut padding_y_multiplier: u64 = 10000;

    #[allow(clippy::comparison_chain)]
    if width_ratio > height_ratio {
        if input_width * crop_size / 100 < output_width2 {
            let min_crop_size = (output_width2 * 100).div_ceil(input_width);
            return Err(CropSizeTooSmall(crop_size, min_crop_size));
        }
        scaled_height = u16::try_from(input_height * padded_width2 / input_width)?;
        padding_y_multiplier = u64::from((10000 * padded_height2) / u32::from(scaled_height));
    } else if width_ratio < height_ratio {
        if input_height * crop_size / 100 < output_height2 {
            let min_crop_size = (output_height2 * 100).div_ceil(input_height);
            return Err(CropSizeTooSmall(crop_size, min_crop_size));
        }
        scaled_width = u16::try_from(input_width * padded_height2 / input_height)?;
        padding_x_multiplier = u64::from((10000 * padded_width2) / u32::from(scaled_width));
    }

    if i.input_width.get() < scaled_width {
        return Err(ScaledWidth(i.input_width.get(), f64::from(scaled_width)));
    }

    let crop_size = u64::from(crop_size);
    let uncrop_x_fn = move |input: u32| -> u32 {
        let input = u64::from(input);
        let crop_x = u64::from(crop_x);
        let output =
            ((padding_x_multiplier * input * crop_size) / 1_000_000) + (padding_x_multiplier * crop_x);
        u32::try_from(output).unwrap_or(u32::MAX)
    };
    let uncrop_y_fn = move |input: u32| -> u32 {
        let input = u64::from(input);
        let crop_y = u64::from(crop_y);
        let output =
            ((padding_y_multiplier * input * crop_size) / 1_000_000) + (padding_y_multiplier * crop_y);
        u32::try_from(output).unwrap_or(u32::MAX)
    };

    fn even(input: u16) -> u16 {
        if input & 1 != 0 { input + 1 } else { input }
    }

    Ok((
        Outputs {
            padded_width: NonZeroU16::new(even(padded_width)).ok_or(Zero)?,
            padded_height: NonZeroU16::new(even(padded_height)).ok_or(Zero)?,
            scaled_width: NonZeroU16::new(even(scaled_width)).ok_or(Zero)?,
            scaled_height: NonZeroU16::new(even(scaled_height)).ok_or(Zero)?,
            crop_x: crop_out_x,
            crop_y: crop_out_y,
            output_width: NonZeroU16::new(output_width).ok_or(Zero)?,
            output_height: NonZeroU16::new(output_height).ok_or(Zero)?,
            output_size: usize::from(output_width) * usize::from(output_height) * 3,
        },
        Uncrop { uncrop_x_fn: Box::new(uncrop_x_fn), uncrop_y_fn: Box::new(uncrop_y_fn) },
    ))
}

#[derive(Debug, Error)]
pub enum ProcessFrameError {
    #[error("unsupported pixel format: {0}")]
    UnsupportedPixelFormat(PixelFormat),

    #[error("create converter: {0}")]
    CreateConverter(#[from] NewConverterError),

    #[error("convert: {0}")]
    Convert(#[from] ConvertError),

    #[error("copy to buffer: {0}")]
    CopyToBuffer(#[from] ImageCopyToBufferError),

    #[error("create scaler: {0}")]
    CreateScaler(#[from] CreateScalerError),

    #[error("scale: {0}")]
    Scale(#[from] ScalerError),

    #[error("pad: {0}")]
    Pad(#[from] PadError),

    #[error("crop: {0}")]
    Crop(#[from] CropError),
}

// Scales, converts to rgb24, pads and crops a decoded frame down to the
// detector's fixed input size. `gray` zeroes chroma beforehand, matching
// detectors named with a `gray_` prefix.
pub fn process_frame(
    outputs: &Outputs,
    mut frame: Frame,
    gray: bool,
) -> Result<Vec<u8>, ProcessFrameError> {
    use ProcessFrameError::UnsupportedPixelFormat;
    if !frame.pix_fmt().is_yuv() {
        return Err(UnsupportedPixelFormat(frame.pix_fmt()));
    }

    if gray {
        let data = frame.data_mut();
        data[1].fill(128);
        data[2].fill(128);
    }

    let mut frame_scaled = Frame::new();
    let mut scaler = Scaler::new(
        frame.width(),
        frame.height(),
        frame.pix_fmt(),
        outputs.scaled_width,
        outputs.scaled_height,
    )?;
    scaler.scale(&frame, &mut frame_scaled)?;

    let mut frame_converted = Frame::new();
    let mut converter = PixelFormatConverter::new(
        frame_scaled.width(),
        frame_scaled.height(),
        frame_scaled.color_range(),
        frame_scaled.pix_fmt(),
        PixelFormat::RGB24,
    )?;
    converter.convert(&frame_scaled, &mut frame_converted)?;

    let mut frame_padded = Frame::new();
    pad(
        &frame_converted,
        &mut frame_padded,
        outputs.padded_width,
        outputs.padded_height,
        0,
        0,
    )?;

    let mut frame_cropped = Frame::new();
    crop(
        &frame_padded,
        &mut frame_cropped,
        outputs.crop_x,
        outputs.crop_y,
        outputs.output_width,
        outputs.output_height,
    )?;

    let mut buf = Vec::with_capacity(outputs.output_size);
    frame_cropped.copy_to_buffer(&mut buf, 1)?;
    Ok(buf)
}

#[derive(Debug, Error)]
pub enum EncodePngError {
    #[error("encode: {0}")]
    Encode(#[from] png::EncodingError),
}

// Encodes an rgb24 buffer as PNG at the fastest compression level.
pub fn encode_png(rgb: &[u8], width: NonZeroU16, height: NonZeroU16) -> Result<Vec<u8>, EncodePngError> {
    let mut buf = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut buf, u32::from(width.get()), u32::from(height.get()));
        encoder.set_color(png::ColorType::Rgb);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_compression(png::Compression::Fast);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(rgb)?;
    }
    Ok(buf)
}

#[derive(Debug, Error)]
pub enum ParseDetectionsError {
    #[error("bad rectangle")]
    BadRectangle,

    #[error("zero")]
    Zero,
}

// Converts detector-space wire detections into input-space, normalized-unit
// `Detection`s: filters by per-label threshold and drops any whose center
// falls inside the configured exclusion mask.
pub fn parse_detections(
    thresholds: &Thresholds,
    mask: &Mask,
    outputs: &Outputs,
    uncrop: &Uncrop,
    raw: Vec<WireDetection>,
) -> Result<Detections, ParseDetectionsError> {
    use ParseDetectionsError::{BadRectangle, Zero};
    let output_width = f32::from(outputs.output_width.get());
    let output_height = f32::from(outputs.output_height.get());

    let mut parsed = Vec::new();
    for d in raw {
        let Ok(label): Result<Label, _> = d.label.parse() else {
            continue;
        };
        let Some(threshold) = thresholds.get(&label) else {
            continue;
        };
        if d.confidence < threshold.as_f32() {
            continue;
        }
        if d.right <= d.left || d.bottom <= d.top {
            return Err(BadRectangle);
        }

        let left = u32_from_fraction(d.left, output_width);
        let top = u32_from_fraction(d.top, output_height);
        let right = u32_from_fraction(d.right, output_width);
        let bottom = u32_from_fraction(d.bottom, output_height);

        let left = (uncrop.uncrop_x_fn)(left);
        let top = (uncrop.uncrop_y_fn)(top);
        let right = (uncrop.uncrop_x_fn)(right);
        let bottom = (uncrop.uncrop_y_fn)(bottom);

        let width = right.saturating_sub(left);
        let height = bottom.saturating_sub(top);

        if mask.enable {
            let center_x = left + (width / 2);
            let center_y = top + (height / 2);
            if vertex_inside_poly2(center_x, center_y, &mask.area) {
                continue;
            }
        }

        parsed.push(Detection {
            label,
            score: d.confidence,
            region: Region {
                rectangle: Some(RectangleNormalized {
                    x: left,
                    y: top,
                    width: NonZeroU32::new(width).ok_or(Zero)?,
                    height: NonZeroU32::new(height).ok_or(Zero)?,
                }),
                polygon: None,
            },
        });
    }
    Ok(parsed)
}

fn u32_from_fraction(fraction: f32, scale: f32) -> u32 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    {
        (fraction.clamp(0.0, 1.0) * scale) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mask;
    use pretty_assertions::assert_eq;
    use std::num::NonZeroU16;

    fn inputs() -> Inputs {
        Inputs {
            input_width: NonZeroU16::new(1920).unwrap(),
            input_height: NonZeroU16::new(1080).unwrap(),
            output_width: NonZeroU16::new(320).unwrap(),
            output_height: NonZeroU16::new(320).unwrap(),
        }
    }

    #[test]
    fn test_calculate_outputs_landscape() {
        let crop = Crop { x: 0, y: 0, size: 100 };
        let (outputs, _) = calculate_outputs(crop, &inputs()).unwrap();
        assert_eq!(320, outputs.output_width.get());
        assert_eq!(320, outputs.output_height.get());
    }

    #[test]
    fn test_calculate_outputs_crop_too_small() {
        let crop = Crop { x: 0, y: 0, size: 1 };
        let err = calculate_outputs(crop, &inputs()).unwrap_err();
        assert!(matches!(err, CalculateOutputsError::CropSizeTooSmall(..)));
    }

    #[test]
    fn test_parse_detections_filters_by_threshold() {
        let crop = Crop { x: 0, y: 0, size: 100 };
        let (outputs, uncrop) = calculate_outputs(crop, &inputs()).unwrap();
        let mut thresholds = Thresholds::new();
        thresholds.insert("person".parse().unwrap(), crate::config::Percent::new(50).unwrap());
        let mask = Mask { enable: false, area: Vec::new() };

        let raw = vec![
            WireDetection { label: "person".to_owned(), confidence: 0.9, top: 0.1, left: 0.1, bottom: 0.5, right: 0.5 },
            WireDetection { label: "person".to_owned(), confidence: 0.1, top: 0.1, left: 0.1, bottom: 0.5, right: 0.5 },
        ];
        let detections = parse_detections(&thresholds, &mask, &outputs, &uncrop, raw).unwrap();
        assert_eq!(1, detections.len());
    }

    #[test]
    fn test_parse_detections_unknown_label_dropped() {
        let crop = Crop { x: 0, y: 0, size: 100 };
        let (outputs, uncrop) = calculate_outputs(crop, &inputs()).unwrap();
        let thresholds = Thresholds::new();
        let mask = Mask { enable: false, area: Vec::new() };

        let raw = vec![WireDetection {
            label: "dog".to_owned(),
            confidence: 0.9,
            top: 0.1,
            left: 0.1,
            bottom: 0.5,
            right: 0.5,
        }];
        let detections = parse_detections(&thresholds, &mask, &outputs, &uncrop, raw).unwrap();
        assert!(detections.is_empty());
    }
}
