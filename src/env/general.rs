// SPDX-License-Identifier: GPL-2.0-or-later

use bytesize::{ByteSize, GB};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::Write,
    path::Path,
};
use thiserror::Error;

/// `general.json`. Editable from the Web UI, unlike `env.yaml`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralConf {
    #[serde(rename = "diskSpace")]
    disk_space: String,
    theme: String,
}

impl GeneralConf {
    pub fn new(path: &Path) -> Result<GeneralConf, GeneralConfigError> {
        use GeneralConfigError::*;
        if !path.exists() {
            let default = GeneralConf::default();
            let data = serde_json::to_vec_pretty(&default).map_err(Serialize)?;
            let mut file = File::create(path).map_err(CreateFile)?;
            file.write_all(&data).map_err(WriteFile)?;
            return Ok(default);
        }

        let raw = fs::read_to_string(path).map_err(ReadFile)?;
        let conf: GeneralConf = serde_json::from_str(&raw).map_err(Deserialize)?;
        Ok(conf)
    }

    /// `diskSpace` is stored as a decimal GB string, e.g. `"5"` or `"2.5"`.
    #[must_use]
    pub fn disk_space(&self) -> ByteSize {
        let gb: f64 = self.disk_space.parse().unwrap_or(5.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        ByteSize((gb * GB as f64) as u64)
    }

    #[must_use]
    pub fn theme(&self) -> &str {
        &self.theme
    }
}

impl Default for GeneralConf {
    fn default() -> Self {
        Self {
            disk_space: "5".to_owned(),
            theme: "default".to_owned(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GeneralConfigError {
    #[error("read general config file: {0}")]
    ReadFile(std::io::Error),

    #[error("create general config file: {0}")]
    CreateFile(std::io::Error),

    #[error("write general config file: {0}")]
    WriteFile(std::io::Error),

    #[error("serialize general config: {0}")]
    Serialize(serde_json::Error),

    #[error("deserialize general config: {0}")]
    Deserialize(serde_json::Error),
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_general_conf_generate_default() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("general.json");

        let conf = GeneralConf::new(&path).unwrap();
        assert_eq!(conf.disk_space(), ByteSize(5 * GB));
        assert_eq!(conf.theme(), "default");
        assert!(path.exists());
    }

    #[test]
    fn test_general_conf_load_existing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("general.json");
        fs::write(&path, r#"{"diskSpace":"20","theme":"dark"}"#).unwrap();

        let conf = GeneralConf::new(&path).unwrap();
        assert_eq!(conf.disk_space(), ByteSize(20 * GB));
        assert_eq!(conf.theme(), "dark");
    }
}
