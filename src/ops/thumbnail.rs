//! Image thumbnails with HTTP validator caching.
//!
//! Decode/resize/encode is delegated to the `image` crate on a blocking
//! worker. The ETag keys on `(realPath, mtime_ms, params)`, so any change
//! to the source or the rendering parameters busts the cache.

use crate::error::ApiError;
use crate::gate::{PathGate, ValidateOptions};
use crate::index::store::mtime_millis;
use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use chrono::{DateTime, Utc};
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageFormat};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Cursor;
use std::path::PathBuf;
use utoipa::ToSchema;

pub const MIN_DIMENSION: u32 = 1;
pub const MAX_DIMENSION: u32 = 2000;
pub const DEFAULT_DIMENSION: u32 = 200;
pub const DEFAULT_QUALITY: u8 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Fit {
    #[default]
    Cover,
    Contain,
    Fill,
    Inside,
    Outside,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    #[default]
    Center,
    Top,
    Bottom,
    Left,
    Right,
    /// Approximated as center; the stack has no saliency analysis.
    Entropy,
    Attention,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Webp,
    Jpeg,
    Png,
    Avif,
}

impl Format {
    pub fn content_type(self) -> &'static str {
        match self {
            Format::Webp => "image/webp",
            Format::Jpeg => "image/jpeg",
            Format::Png => "image/png",
            Format::Avif => "image/avif",
        }
    }
}

impl fmt::Display for Fit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Fit::Cover => "cover",
            Fit::Contain => "contain",
            Fit::Fill => "fill",
            Fit::Inside => "inside",
            Fit::Outside => "outside",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Position::Center => "center",
            Position::Top => "top",
            Position::Bottom => "bottom",
            Position::Left => "left",
            Position::Right => "right",
            Position::Entropy => "entropy",
            Position::Attention => "attention",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Format::Webp => "webp",
            Format::Jpeg => "jpeg",
            Format::Png => "png",
            Format::Avif => "avif",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ThumbnailParams {
    pub width: u32,
    pub height: u32,
    pub fit: Fit,
    pub position: Position,
    pub format: Format,
    pub quality: u8,
}

impl Default for ThumbnailParams {
    fn default() -> Self {
        Self {
            width: DEFAULT_DIMENSION,
            height: DEFAULT_DIMENSION,
            fit: Fit::default(),
            position: Position::default(),
            format: Format::default(),
            quality: DEFAULT_QUALITY,
        }
    }
}

impl ThumbnailParams {
    pub fn validate(&self) -> Result<(), ApiError> {
        let dims = [self.width, self.height];
        if dims.iter().any(|d| !(MIN_DIMENSION..=MAX_DIMENSION).contains(d)) {
            return Err(ApiError::BadRequest("invalid dimensions".to_string()));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(ApiError::BadRequest("invalid quality".to_string()));
        }
        Ok(())
    }

    fn cache_key(&self) -> String {
        format!(
            "{}x{}:{}:{}:{}:{}",
            self.width, self.height, self.fit, self.position, self.format, self.quality
        )
    }
}

pub async fn thumbnail(
    gate: &PathGate,
    path: &str,
    params: ThumbnailParams,
    request_headers: &HeaderMap,
) -> Result<Response, ApiError> {
    params.validate()?;

    let resolved = gate.validate(path, &ValidateOptions::default()).await?;
    let meta = tokio::fs::metadata(&resolved.real_path).await?;
    if meta.is_dir() {
        return Err(ApiError::BadRequest("not a file".to_string()));
    }

    let mtime_ms = mtime_millis(&meta);
    let etag = {
        let digest = Sha256::digest(
            format!("{}:{mtime_ms}:{}", resolved.real_path.display(), params.cache_key()).as_bytes(),
        );
        hex::encode(digest)[..16].to_string()
    };
    let last_modified = http_date(mtime_ms);

    if is_fresh(request_headers, &etag, mtime_ms) {
        return Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::ETAG, format!("\"{etag}\""))
            .header(header::LAST_MODIFIED, &last_modified)
            .body(Body::empty())
            .map_err(|e| ApiError::Internal(e.to_string()));
    }

    let source = resolved.real_path.clone();
    let bytes = tokio::task::spawn_blocking(move || render(source, params))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, params.format.content_type())
        .header(header::CONTENT_LENGTH, bytes.len())
        .header(header::CACHE_CONTROL, "public, max-age=31536000, immutable")
        .header(header::ETAG, format!("\"{etag}\""))
        .header(header::LAST_MODIFIED, &last_modified)
        .body(Body::from(bytes))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

fn is_fresh(headers: &HeaderMap, etag: &str, mtime_ms: i64) -> bool {
    if let Some(candidates) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        return candidates
            .split(',')
            .map(|c| c.trim().trim_matches('"'))
            .any(|c| c == etag || c == "*");
    }
    if let Some(since) = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
    {
        // HTTP dates carry second precision only.
        return mtime_ms / 1000 <= since.timestamp();
    }
    false
}

fn http_date(mtime_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(mtime_ms)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn render(source: PathBuf, params: ThumbnailParams) -> Result<Vec<u8>, ApiError> {
    let img = image::ImageReader::open(&source)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .decode()
        .map_err(|e| ApiError::BadRequest(format!("unsupported image: {e}")))?;

    let resized = resize(img, params);
    encode(&resized, params)
}

fn resize(img: DynamicImage, params: ThumbnailParams) -> DynamicImage {
    let (w, h) = (params.width, params.height);
    match params.fit {
        Fit::Fill => img.resize_exact(w, h, FilterType::Lanczos3),
        Fit::Inside => img.resize(w, h, FilterType::Lanczos3),
        Fit::Outside => {
            let (nw, nh) = scale_to_cover(img.dimensions(), w, h);
            img.resize_exact(nw, nh, FilterType::Lanczos3)
        }
        Fit::Cover => {
            let (nw, nh) = scale_to_cover(img.dimensions(), w, h);
            let scaled = img.resize_exact(nw, nh, FilterType::Lanczos3);
            let (x, y) = crop_origin(nw, nh, w, h, params.position);
            scaled.crop_imm(x, y, w, h)
        }
        Fit::Contain => {
            let resized = img.resize(w, h, FilterType::Lanczos3);
            let mut canvas = image::RgbaImage::from_pixel(w, h, image::Rgba([0, 0, 0, 0]));
            let (rw, rh) = resized.dimensions();
            let x = i64::from((w - rw.min(w)) / 2);
            let y = i64::from((h - rh.min(h)) / 2);
            image::imageops::overlay(&mut canvas, &resized.to_rgba8(), x, y);
            DynamicImage::ImageRgba8(canvas)
        }
    }
}

/// Smallest scale that covers the target box in both dimensions.
fn scale_to_cover((iw, ih): (u32, u32), w: u32, h: u32) -> (u32, u32) {
    let scale = f64::max(f64::from(w) / f64::from(iw), f64::from(h) / f64::from(ih));
    let nw = (f64::from(iw) * scale).round().max(f64::from(w)) as u32;
    let nh = (f64::from(ih) * scale).round().max(f64::from(h)) as u32;
    (nw, nh)
}

fn crop_origin(nw: u32, nh: u32, w: u32, h: u32, position: Position) -> (u32, u32) {
    let spare_x = nw.saturating_sub(w);
    let spare_y = nh.saturating_sub(h);
    match position {
        Position::Left => (0, spare_y / 2),
        Position::Right => (spare_x, spare_y / 2),
        Position::Top => (spare_x / 2, 0),
        Position::Bottom => (spare_x / 2, spare_y),
        Position::Center | Position::Entropy | Position::Attention => (spare_x / 2, spare_y / 2),
    }
}

fn encode(img: &DynamicImage, params: ThumbnailParams) -> Result<Vec<u8>, ApiError> {
    let mut out = Cursor::new(Vec::new());
    match params.format {
        Format::Png => img
            .write_to(&mut out, ImageFormat::Png)
            .map_err(|e| ApiError::Internal(e.to_string()))?,
        Format::Jpeg => {
            let encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, params.quality);
            img.to_rgb8()
                .write_with_encoder(encoder)
                .map_err(|e| ApiError::Internal(e.to_string()))?;
        }
        Format::Webp => {
            // The crate's webp encoder is lossless; quality does not apply.
            let rgba = img.to_rgba8();
            image::codecs::webp::WebPEncoder::new_lossless(&mut out)
                .encode(rgba.as_raw(), rgba.width(), rgba.height(), ExtendedColorType::Rgba8)
                .map_err(|e| ApiError::Internal(e.to_string()))?;
        }
        Format::Avif => {
            let encoder = image::codecs::avif::AvifEncoder::new_with_speed_quality(
                &mut out,
                6,
                params.quality,
            );
            img.to_rgba8()
                .write_with_encoder(encoder)
                .map_err(|e| ApiError::Internal(e.to_string()))?;
        }
    }
    Ok(out.into_inner())
}
