use std::io::Read;

use flate2::read::{GzDecoder, ZlibDecoder};
use serde_json::Value;

use crate::transport::RawResponse;

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    /// Diffs, branch heads and anything else that isn't JSON.
    Text(String),
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

impl ApiResponse {
    pub fn json(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Json(value) => Some(value),
            ResponseBody::Text(_) => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Text(text) => Some(text),
            ResponseBody::Json(_) => None,
        }
    }

    pub fn into_json(self) -> Option<Value> {
        match self.body {
            ResponseBody::Json(value) => Some(value),
            ResponseBody::Text(_) => None,
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self.body, ResponseBody::Json(_))
    }
}

/// Undo any content encoding, then try JSON and fall back to text.
pub(crate) fn decode_response(raw: RawResponse) -> Result<ApiResponse, std::io::Error> {
    let encoding = raw
        .header("content-encoding")
        .map(|value| value.trim().to_ascii_lowercase());
    let bytes = match encoding.as_deref() {
        Some("gzip") | Some("x-gzip") => {
            let mut decoded = Vec::new();
            GzDecoder::new(raw.body.as_slice()).read_to_end(&mut decoded)?;
            decoded
        }
        Some("deflate") => {
            let mut decoded = Vec::new();
            ZlibDecoder::new(raw.body.as_slice()).read_to_end(&mut decoded)?;
            decoded
        }
        _ => raw.body,
    };

    let body = match serde_json::from_slice::<Value>(&bytes) {
        Ok(value) => ResponseBody::Json(value),
        Err(_) => ResponseBody::Text(String::from_utf8_lossy(&bytes).into_owned()),
    };
    Ok(ApiResponse {
        status: raw.status,
        headers: raw.headers,
        body,
    })
}
