// SPDX-License-Identifier: GPL-2.0-or-later

#![allow(clippy::unwrap_used)]

use crate::js_module_handler;
use axum::{body::to_bytes, http::HeaderMap, response::IntoResponse};
use http::{StatusCode, header};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn handle_js_module_ok() {
    let response = js_module_handler(HeaderMap::new()).await.into_response();

    assert_eq!(StatusCode::OK, response.status());
    assert_eq!(
        "text/javascript; charset=UTF-8",
        response.headers().get(header::CONTENT_TYPE).unwrap()
    );
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8(body.to_vec()).unwrap().contains("hlsPlaylistUrl"));
}

#[tokio::test]
async fn handle_js_module_not_modified() {
    let first = js_module_handler(HeaderMap::new()).await.into_response();
    let etag = first
        .headers()
        .get(header::ETAG)
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();

    let mut headers = HeaderMap::new();
    headers.insert(header::IF_NONE_MATCH, etag.parse().unwrap());
    let second = js_module_handler(headers).await.into_response();

    assert_eq!(StatusCode::NOT_MODIFIED, second.status());
}
