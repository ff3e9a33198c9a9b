// SPDX-License-Identifier: GPL-2.0-or-later

use common::{Label, PolygonNormalized};
use serde::Deserialize;
use std::{collections::HashMap, ops::Deref, time::Duration};
use thiserror::Error;

pub type Thresholds = HashMap<Label, Percent>;

#[derive(Clone, Debug, PartialEq)]
pub struct DoodsConfig {
    pub thresholds: Thresholds,
    pub crop: Crop,
    pub mask: Mask,
    pub detector_name: DetectorName,
    pub feed_rate: Duration,
    pub trigger_duration: Duration,
    pub use_sub_stream: bool,
}

#[derive(Deserialize)]
struct RawConfigV1 {
    enable: bool,
    thresholds: Thresholds,
    crop: Crop,
    mask: Mask,

    #[serde(rename = "detectorName")]
    detector_name: DetectorName,

    #[serde(rename = "feedRate")]
    feed_rate: f64,
    duration: f64,

    #[serde(rename = "useSubStream")]
    use_sub_stream: bool,
}

impl DoodsConfig {
    // A monitor's raw config carries an empty `doods: {}` object when
    // detection isn't configured for it; that's not an error, just absence.
    pub fn parse(raw: &serde_json::Value) -> Result<Option<Self>, serde_json::Error> {
        #[derive(Deserialize)]
        struct Temp {
            doods: serde_json::Value,
        }
        let Ok(temp) = serde_json::from_value::<Temp>(raw.clone()) else {
            return Ok(None);
        };
        if temp.doods == serde_json::Value::Object(serde_json::Map::new()) {
            return Ok(None);
        }

        let c: RawConfigV1 = serde_json::from_value(temp.doods)?;
        if !c.enable {
            return Ok(None);
        }

        Ok(Some(Self {
            thresholds: c.thresholds,
            crop: c.crop,
            mask: c.mask,
            detector_name: c.detector_name,
            feed_rate: Duration::from_secs_f64(c.feed_rate),
            trigger_duration: Duration::from_secs_f64(c.duration),
            use_sub_stream: c.use_sub_stream,
        }))
    }

    // Gray-scale detectors are named with a `gray_` prefix; the pipeline
    // zeroes the frame's chroma before scaling for these.
    #[must_use]
    pub fn is_gray_detector(&self) -> bool {
        self.detector_name.as_str().starts_with("gray_")
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Mask {
    pub enable: bool,
    pub area: PolygonNormalized,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct Crop {
    pub x: u32,
    pub y: u32,
    pub size: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("value is greater than 100")]
pub struct ParsePercentError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Percent(u8);

impl Percent {
    pub fn new(v: u8) -> Result<Self, ParsePercentError> {
        if v > 100 { Err(ParsePercentError) } else { Ok(Self(v)) }
    }

    #[must_use]
    pub fn as_f32(self) -> f32 {
        f32::from(self.0)
    }
}

impl<'de> Deserialize<'de> for Percent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v = u8::deserialize(deserializer)?;
        Self::new(v).map_err(serde::de::Error::custom)
    }
}

impl Deref for Percent {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize)]
pub struct DetectorName(String);

impl DetectorName {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for DetectorName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for DetectorName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_percent_rejects_over_100() {
        assert_eq!(Err(ParsePercentError), Percent::new(101));
        assert!(Percent::new(100).is_ok());
    }

    #[test]
    fn test_parse_missing_doods_is_none() {
        let raw = json!({"id": "a"});
        assert_eq!(None, DoodsConfig::parse(&raw).unwrap());
    }

    #[test]
    fn test_parse_empty_doods_object_is_none() {
        let raw = json!({"doods": {}});
        assert_eq!(None, DoodsConfig::parse(&raw).unwrap());
    }

    #[test]
    fn test_parse_disabled_is_none() {
        let raw = json!({"doods": {
            "enable": false,
            "thresholds": {},
            "crop": {"x": 0, "y": 0, "size": 100},
            "mask": {"enable": false, "area": []},
            "detectorName": "default",
            "feedRate": 0.5,
            "duration": 120.0,
            "useSubStream": true
        }});
        assert_eq!(None, DoodsConfig::parse(&raw).unwrap());
    }

    #[test]
    fn test_parse_enabled() {
        let raw = json!({"doods": {
            "enable": true,
            "thresholds": {"person": 50},
            "crop": {"x": 0, "y": 0, "size": 100},
            "mask": {"enable": false, "area": []},
            "detectorName": "gray_default",
            "feedRate": 0.5,
            "duration": 120.0,
            "useSubStream": true
        }});
        let config = DoodsConfig::parse(&raw).unwrap().unwrap();
        assert!(config.is_gray_detector());
        assert_eq!(Duration::from_secs_f64(0.5), config.feed_rate);
    }
}
