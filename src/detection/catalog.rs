// SPDX-License-Identifier: GPL-2.0-or-later

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use serde::Deserialize;
use std::num::NonZeroU16;
use thiserror::Error;
use url::Url;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DetectorInfo {
    pub name: String,
    pub model: String,
    pub labels: Vec<String>,
    pub width: NonZeroU16,
    pub height: NonZeroU16,
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    detectors: Vec<DetectorInfo>,
}

#[derive(Debug, Error)]
pub enum FetchCatalogError {
    #[error("parse url: {0}")]
    ParseUrl(#[from] url::ParseError),

    #[error("build request: {0}")]
    BuildRequest(http::Error),

    #[error("send request: {0}")]
    SendRequest(hyper_util::client::legacy::Error),

    #[error("collect body: {0}")]
    CollectBody(hyper::Error),

    #[error("deserialize: {0}")]
    Deserialize(serde_json::Error),
}

// Fetches the detector catalog once at startup: `GET http://<ip>/detectors`.
pub async fn fetch_catalog(base_url: &Url) -> Result<Vec<DetectorInfo>, FetchCatalogError> {
    use FetchCatalogError::{BuildRequest, CollectBody, Deserialize, SendRequest};

    let url = base_url.join("detectors")?;

    let req = hyper::Request::builder()
        .uri(url.as_str())
        .body(Empty::<Bytes>::new())
        .map_err(BuildRequest)?;

    let client = Client::builder(TokioExecutor::new()).build_http();
    let res = client.request(req).await.map_err(SendRequest)?;
    let body = res
        .into_body()
        .collect()
        .await
        .map_err(CollectBody)?
        .to_bytes();

    let parsed: CatalogResponse = serde_json::from_slice(&body).map_err(Deserialize)?;
    Ok(parsed.detectors)
}
