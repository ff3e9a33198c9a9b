// SPDX-License-Identifier: GPL-2.0-or-later

mod general;

pub use general::{GeneralConf, GeneralConfigError};

use bytesize::ByteSize;
use common::EnvConfig;
use serde::Deserialize;
use std::{
    collections::HashMap,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};
use thiserror::Error;
use url::Url;

/// Main config. Should not be editable from the Web UI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvConf {
    port: u16,
    rtsp_port: u16,
    rtsp_port_expose: bool,
    hls_port: u16,
    hls_port_expose: bool,
    detector_url: Url,
    max_disk_usage: ByteSize,
    go_bin: PathBuf,
    ffmpeg_bin: PathBuf,
    storage_dir: PathBuf,
    recordings_dir: PathBuf,
    home_dir: PathBuf,
    config_dir: PathBuf,
    raw: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEnvConf {
    port: u16,
    rtsp_port: u16,
    rtsp_port_expose: bool,
    hls_port: u16,
    hls_port_expose: bool,
    detector_url: Url,
    max_disk_usage_gb: u64,
    go_bin: PathBuf,
    ffmpeg_bin: PathBuf,
    storage_dir: PathBuf,
    home_dir: PathBuf,
}

impl EnvConf {
    pub fn new(config_path: &PathBuf) -> Result<EnvConf, EnvConfigNewError> {
        use EnvConfigNewError::*;
        let file_exist = config_path.exists();
        if !file_exist {
            print!(
                "\n\nGenerating '{}' and exiting..\n\n\n",
                config_path.to_string_lossy()
            );

            let cwd = std::env::current_dir().map_err(GetCwd)?;
            generate_config(config_path, &cwd)?;
            std::process::exit(0);
        }

        let env_yaml = fs::read_to_string(config_path).map_err(ReadFile)?;
        let env = parse_config(env_yaml)?;

        Ok(env)
    }

    #[must_use]
    pub fn detector_url(&self) -> &Url {
        &self.detector_url
    }

    #[must_use]
    pub fn max_disk_usage(&self) -> ByteSize {
        self.max_disk_usage
    }
}

impl EnvConfig for EnvConf {
    fn port(&self) -> u16 {
        self.port
    }
    fn rtsp_port(&self) -> u16 {
        self.rtsp_port
    }
    fn rtsp_port_expose(&self) -> bool {
        self.rtsp_port_expose
    }
    fn hls_port(&self) -> u16 {
        self.hls_port
    }
    fn hls_port_expose(&self) -> bool {
        self.hls_port_expose
    }
    fn go_bin(&self) -> &Path {
        &self.go_bin
    }
    fn ffmpeg_bin(&self) -> &Path {
        &self.ffmpeg_bin
    }
    fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }
    fn recordings_dir(&self) -> &Path {
        &self.recordings_dir
    }
    fn home_dir(&self) -> &Path {
        &self.home_dir
    }
    fn config_dir(&self) -> &Path {
        &self.config_dir
    }
    fn raw(&self) -> &str {
        &self.raw
    }
}

#[derive(Debug, Error)]
pub enum EnvConfigNewError {
    #[error("read env config file: {0}")]
    ReadFile(std::io::Error),

    #[error("generate env config: {0}")]
    Generate(#[from] GenerateEnvConfigError),

    #[error("parse env config: {0}")]
    Parse(#[from] ParseEnvConfigError),

    #[error("get current working directory: {0}")]
    GetCwd(std::io::Error),
}

#[derive(Debug, Error)]
pub enum GenerateEnvConfigError {
    #[error("create file: {0}")]
    CreateFile(std::io::Error),

    #[error("templater error: {0}")]
    AddTemplate(upon::Error),

    #[error("render template: {0}")]
    RenderTemplate(upon::Error),

    #[error("get parent directory")]
    GetParentDir(),

    #[error("create directory: {0}")]
    CreateDir(std::io::Error),

    #[error("write file: {0}")]
    WriteFile(std::io::Error),
}

fn generate_config(path: &Path, cwd: &Path) -> Result<(), GenerateEnvConfigError> {
    use GenerateEnvConfigError::*;

    let data = HashMap::from([("cwd", cwd)]);

    let mut engine = upon::Engine::new();
    engine
        .add_template("config", CONFIG_TEMPLATE)
        .map_err(AddTemplate)?;

    let config = engine
        .get_template("config")
        .expect("template should just have been added")
        .render(data)
        .to_string()
        .map_err(RenderTemplate)?;

    let config_dir = path.parent().ok_or(GetParentDir())?;
    fs::create_dir_all(config_dir).map_err(CreateDir)?;

    let mut file = File::create(path).map_err(CreateFile)?;
    write!(file, "{config}").map_err(WriteFile)?;

    Ok(())
}

const CONFIG_TEMPLATE: &str = include_str!("./default_config.tpl");

#[derive(Debug, Error)]
pub enum ParseEnvConfigError {
    #[error("{0}")]
    DeserializeYaml(#[from] serde_yaml::Error),

    #[error("{0} path is not absolute '{1}'")]
    PathNotAbsolute(String, PathBuf),

    #[error("{0} does not exist '{1}'")]
    BinNotFound(String, PathBuf),

    #[error("create storage dir: {0} {1}")]
    CreateStorageDir(PathBuf, std::io::Error),

    #[error("create recordings dir: {0} {1}")]
    CreateRecDir(PathBuf, std::io::Error),

    #[error("canonicalize path: {0:?} {1}")]
    Canonicalize(PathBuf, std::io::Error),
}

fn parse_config(env_yaml: String) -> Result<EnvConf, ParseEnvConfigError> {
    use ParseEnvConfigError::*;
    let raw: RawEnvConf = serde_yaml::from_str(&env_yaml)?;

    if !raw.storage_dir.is_absolute() {
        return Err(PathNotAbsolute("storageDir".to_owned(), raw.storage_dir));
    }
    if !raw.home_dir.is_absolute() {
        return Err(PathNotAbsolute("homeDir".to_owned(), raw.home_dir));
    }
    if !raw.go_bin.as_os_str().is_empty() && !raw.go_bin.is_absolute() {
        return Err(PathNotAbsolute("goBin".to_owned(), raw.go_bin));
    }
    if !raw.ffmpeg_bin.as_os_str().is_empty() && !raw.ffmpeg_bin.is_absolute() {
        return Err(PathNotAbsolute("ffmpegBin".to_owned(), raw.ffmpeg_bin));
    }
    if !raw.ffmpeg_bin.as_os_str().is_empty() && !raw.ffmpeg_bin.exists() {
        return Err(BinNotFound("ffmpegBin".to_owned(), raw.ffmpeg_bin));
    }
    if !raw.go_bin.as_os_str().is_empty() && !raw.go_bin.exists() {
        return Err(BinNotFound("goBin".to_owned(), raw.go_bin));
    }

    std::fs::create_dir_all(&raw.storage_dir)
        .map_err(|e| CreateStorageDir(raw.storage_dir.clone(), e))?;
    let storage_dir = raw
        .storage_dir
        .canonicalize()
        .map_err(|e| Canonicalize(raw.storage_dir, e))?;

    let recordings_dir = storage_dir.join("recordings");
    std::fs::create_dir_all(&recordings_dir)
        .map_err(|e| CreateRecDir(recordings_dir.clone(), e))?;
    let recordings_dir = recordings_dir
        .canonicalize()
        .map_err(|e| Canonicalize(recordings_dir, e))?;

    let home_dir = raw
        .home_dir
        .canonicalize()
        .map_err(|e| Canonicalize(raw.home_dir, e))?;

    let config_dir = home_dir.join("configs");
    std::fs::create_dir_all(&config_dir).map_err(|e| Canonicalize(config_dir.clone(), e))?;

    Ok(EnvConf {
        port: raw.port,
        rtsp_port: raw.rtsp_port,
        rtsp_port_expose: raw.rtsp_port_expose,
        hls_port: raw.hls_port,
        hls_port_expose: raw.hls_port_expose,
        detector_url: raw.detector_url,
        max_disk_usage: ByteSize::gb(raw.max_disk_usage_gb),
        go_bin: raw.go_bin,
        ffmpeg_bin: raw.ffmpeg_bin,
        storage_dir,
        recordings_dir,
        home_dir,
        config_dir,
        raw: env_yaml,
    })
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_config() {
        let temp_dir = TempDir::new().unwrap();
        std::env::set_current_dir(temp_dir.path()).unwrap();
        let config_file = temp_dir.path().join("configs").join("env.yaml");

        generate_config(&config_file, temp_dir.path()).unwrap();
        EnvConf::new(&config_file).unwrap();
    }

    #[test]
    fn test_parse_config_ok() {
        let temp_dir = TempDir::new().unwrap();
        let storage_dir = temp_dir.path().join("storage");
        let home_dir = temp_dir.path().join("home");
        std::fs::create_dir(&home_dir).unwrap();
        let storage_dir_str = storage_dir.to_str().unwrap();
        let home_dir_str = home_dir.to_str().unwrap();

        let config = format!(
            "
            port: 2020
            rtspPort: 2021
            rtspPortExpose: false
            hlsPort: 2022
            hlsPortExpose: false
            detectorUrl: \"http://127.0.0.1:8090/\"
            maxDiskUsageGb: 1000
            goBin: \"\"
            ffmpegBin: \"\"
            storageDir: \"{storage_dir_str}\"
            homeDir: \"{home_dir_str}\"
        ",
        );

        let storage_dir: PathBuf = storage_dir.parse().unwrap();
        let home_dir: PathBuf = home_dir.parse().unwrap();
        let want = EnvConf {
            port: 2020,
            rtsp_port: 2021,
            rtsp_port_expose: false,
            hls_port: 2022,
            hls_port_expose: false,
            detector_url: "http://127.0.0.1:8090/".parse().unwrap(),
            max_disk_usage: ByteSize::gb(1000),
            go_bin: PathBuf::new(),
            ffmpeg_bin: PathBuf::new(),
            storage_dir: storage_dir.clone(),
            recordings_dir: storage_dir.join("recordings"),
            home_dir: home_dir.clone(),
            config_dir: home_dir.join("configs"),
            raw: config.clone(),
        };
        let got = parse_config(config).unwrap();
        assert_eq!(want, got);
    }

    #[test]
    fn test_parse_config_deserialize_error() {
        assert!(matches!(
            parse_config("&".to_owned()),
            Err(ParseEnvConfigError::DeserializeYaml(_)),
        ));
    }

    #[test]
    fn test_parse_config_storage_dir_abs_error() {
        let config = "
            port: 2020
            rtspPort: 2021
            rtspPortExpose: false
            hlsPort: 2022
            hlsPortExpose: false
            detectorUrl: \"http://127.0.0.1:8090/\"
            maxDiskUsageGb: 1000
            goBin: \"\"
            ffmpegBin: \"\"
            storageDir: \".\"
            homeDir: \"/ok\"
        ";

        assert!(matches!(
            parse_config(config.to_owned()),
            Err(ParseEnvConfigError::PathNotAbsolute(..))
        ));
    }

    #[test]
    fn test_parse_config_home_dir_abs_error() {
        let config = "
            port: 2020
            rtspPort: 2021
            rtspPortExpose: false
            hlsPort: 2022
            hlsPortExpose: false
            detectorUrl: \"http://127.0.0.1:8090/\"
            maxDiskUsageGb: 1000
            goBin: \"\"
            ffmpegBin: \"\"
            storageDir: \"/ok\"
            homeDir: \".\"
        ";

        assert!(matches!(
            parse_config(config.to_owned()),
            Err(ParseEnvConfigError::PathNotAbsolute(..))
        ));
    }
}
