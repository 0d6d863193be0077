//! Conversions between base64 text, files, URLs and in-memory images.

use std::{io::Cursor, path::Path, time::Duration};

use anyhow::{Context, Result};
use base64::{prelude::BASE64_STANDARD, Engine};
use image::{DynamicImage, ImageFormat};
use tracing::{debug, warn};

use crate::{TintError, TintResult};

pub const PNG_DATA_URI_PREFIX: &str = "data:image/png;base64,";

/// Timeout for fetching a source image by URL.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Decodes a base64 image, with or without a `data:` URI header.
/// Line breaks and other ASCII whitespace inside the payload are ignored.
pub fn decode_base64_image(encoded: &str) -> TintResult<DynamicImage> {
    let payload: String = encoded
        .rsplit(',')
        .next()
        .unwrap_or(encoded)
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let bytes = BASE64_STANDARD
        .decode(payload)
        .map_err(|e| TintError::ImageDecode(e.to_string()))?;
    image::load_from_memory(&bytes).map_err(|e| TintError::ImageDecode(e.to_string()))
}

/// Encodes an image as a PNG data URI.
pub fn encode_base64_image(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed to encode image as PNG")?;
    Ok(format!("{PNG_DATA_URI_PREFIX}{}", BASE64_STANDARD.encode(&bytes)))
}

/// Opens an image file and normalizes it to RGB.
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    let img = image::open(path).with_context(|| format!("failed to open image {path:?}"))?;
    Ok(DynamicImage::ImageRgb8(img.to_rgb8()))
}

pub fn http_client(timeout: Duration) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")
}

/// Fetches an image over HTTP(S), normalized to RGB.
///
/// Returns `None` on any network or decode failure; the cause is logged.
pub fn fetch_image(client: &reqwest::blocking::Client, url: &str) -> Option<DynamicImage> {
    match try_fetch_image(client, url) {
        Ok(img) => Some(img),
        Err(e) => {
            warn!("failed to fetch image from {url}: {e:#}");
            None
        }
    }
}

fn try_fetch_image(client: &reqwest::blocking::Client, url: &str) -> Result<DynamicImage> {
    let response = client
        .get(url)
        .send()
        .with_context(|| format!("request to {url} failed"))?
        .error_for_status()?;
    let bytes = response.bytes().context("failed reading image body")?;
    debug!("fetched {} bytes from {url}", bytes.len());
    let img = image::load_from_memory(&bytes).context("response is not a supported image")?;
    Ok(DynamicImage::ImageRgb8(img.to_rgb8()))
}
