//! Picture payload decoding.
//!
//! Field units send their camera snapshot either as a raw RGBA pixel matrix
//! (nested JSON arrays of any depth) or as a base64 string holding an image
//! that is already encoded. Both shapes end up as the bytes of an image file.

use base64::{engine::general_purpose::STANDARD, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbaImage};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// JPEG quality used for pixel matrices.
pub const JPEG_QUALITY: u8 = 50;

/// Bytes per pixel in a raw matrix (RGBA).
const CHANNELS: usize = 4;

/// Errors that can occur while turning a payload into image bytes.
#[derive(Debug, Error)]
pub enum PictureError {
    #[error("Picture data must be an array of pixels or a base64 string")]
    UnsupportedData,

    #[error("Picture {0} is required")]
    MissingDimension(&'static str),

    #[error("Invalid image dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Expected {expected} pixel values for {width}x{height} RGBA, got {actual}")]
    LengthMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid pixel value at index {index}: {value}")]
    InvalidPixel { index: usize, value: Value },

    #[error("Invalid base64 image: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Picture decoding interrupted: {0}")]
    Interrupted(String),
}

/// The `picture` object as it arrives in a status request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PictureRequest {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

/// A picture payload whose shape has been decided.
#[derive(Debug, Clone, PartialEq)]
pub enum PicturePayload {
    /// Nested RGBA pixel values, possibly irregularly nested
    RawMatrix {
        data: Vec<Value>,
        width: u32,
        height: u32,
    },
    /// Base64 text of an already encoded image
    EncodedImage {
        encoded: String,
        width: u32,
        height: u32,
    },
}

/// Image bytes ready to be written, with the dimensions reported by the unit.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPicture {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl TryFrom<PictureRequest> for PicturePayload {
    type Error = PictureError;

    fn try_from(request: PictureRequest) -> Result<Self, Self::Error> {
        let width = request.width.ok_or(PictureError::MissingDimension("width"))?;
        let height = request
            .height
            .ok_or(PictureError::MissingDimension("height"))?;

        match request.data {
            Some(Value::Array(data)) => Ok(PicturePayload::RawMatrix {
                data,
                width,
                height,
            }),
            Some(Value::String(encoded)) => Ok(PicturePayload::EncodedImage {
                encoded,
                width,
                height,
            }),
            _ => Err(PictureError::UnsupportedData),
        }
    }
}

impl PicturePayload {
    pub fn width(&self) -> u32 {
        match self {
            PicturePayload::RawMatrix { width, .. } | PicturePayload::EncodedImage { width, .. } => {
                *width
            }
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            PicturePayload::RawMatrix { height, .. }
            | PicturePayload::EncodedImage { height, .. } => *height,
        }
    }
}

/// Turn a payload into the bytes of an image file.
///
/// Pixel matrices are flattened and JPEG encoded; base64 images are decoded
/// and kept as-is. Width and height are carried over from the payload.
pub fn decode_picture(payload: &PicturePayload) -> Result<DecodedPicture, PictureError> {
    let bytes = match payload {
        PicturePayload::RawMatrix {
            data,
            width,
            height,
        } => {
            let flat = flatten_pixels(data);
            let pixels = pixel_bytes(&flat)?;
            encode_jpeg(&pixels, *width, *height)?
        }
        PicturePayload::EncodedImage { encoded, .. } => STANDARD.decode(encoded)?,
    };

    Ok(DecodedPicture {
        bytes,
        width: payload.width(),
        height: payload.height(),
    })
}

/// Flatten arbitrarily nested arrays into one sequence, depth first, left to right.
///
/// Non-array leaves are passed through untouched. Traversal keeps its own
/// stack so deeply nested input cannot exhaust the call stack.
pub fn flatten_pixels(values: &[Value]) -> Vec<Value> {
    let mut flat = Vec::with_capacity(values.len());
    let mut stack = vec![values.iter()];

    while let Some(level) = stack.last_mut() {
        match level.next() {
            Some(Value::Array(inner)) => stack.push(inner.iter()),
            Some(leaf) => flat.push(leaf.clone()),
            None => {
                stack.pop();
            }
        }
    }

    flat
}

/// Convert flattened JSON numbers into channel bytes.
fn pixel_bytes(values: &[Value]) -> Result<Vec<u8>, PictureError> {
    values
        .iter()
        .enumerate()
        .map(|(index, value)| {
            value
                .as_f64()
                .filter(|v| v.fract() == 0.0 && (0.0..=255.0).contains(v))
                .map(|v| v as u8)
                .ok_or_else(|| PictureError::InvalidPixel {
                    index,
                    value: value.clone(),
                })
        })
        .collect()
}

/// Encode RGBA pixels as a JPEG at [`JPEG_QUALITY`].
///
/// `pixels.len()` must equal `width * height * 4`. JPEG has no alpha channel,
/// so alpha is dropped.
pub fn encode_jpeg(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>, PictureError> {
    if width == 0 || height == 0 {
        return Err(PictureError::InvalidDimensions { width, height });
    }

    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(CHANNELS))
        .ok_or(PictureError::InvalidDimensions { width, height })?;

    if pixels.len() != expected {
        return Err(PictureError::LengthMismatch {
            width,
            height,
            expected,
            actual: pixels.len(),
        });
    }

    let rgba = RgbaImage::from_raw(width, height, pixels.to_vec())
        .ok_or(PictureError::InvalidDimensions { width, height })?;
    let rgb = DynamicImage::ImageRgba8(rgba).to_rgb8();

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY).encode_image(&rgb)?;

    Ok(jpeg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(v: Value) -> Vec<Value> {
        match v {
            Value::Array(items) => items,
            other => panic!("expected array, got {}", other),
        }
    }

    #[test]
    fn test_flatten_empty() {
        assert!(flatten_pixels(&[]).is_empty());
    }

    #[test]
    fn test_flatten_matrix() {
        let flat = flatten_pixels(&values(json!([[1, 2], [3, 4]])));
        assert_eq!(flat, values(json!([1, 2, 3, 4])));
    }

    #[test]
    fn test_flatten_three_dimensions() {
        let input = json!([[[1, 2, 3], [4, 5, 6]], [[7, 8, 9], [10, 11, 12]]]);
        let flat = flatten_pixels(&values(input));
        assert_eq!(flat, values(json!([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12])));
    }

    #[test]
    fn test_flatten_irregular_nesting() {
        let input = json!([[1, 2], 3, [[4, 5], [6, 7]], 8]);
        let flat = flatten_pixels(&values(input));
        assert_eq!(flat, values(json!([1, 2, 3, 4, 5, 6, 7, 8])));
    }

    #[test]
    fn test_flatten_skips_empty_branches_and_keeps_odd_leaves() {
        let input = json!([[], [[]], "x", [null, [true]]]);
        let flat = flatten_pixels(&values(input));
        assert_eq!(flat, values(json!(["x", null, true])));
    }

    #[test]
    fn test_flatten_deep_nesting() {
        let mut nested = json!(7);
        for _ in 0..2_000 {
            nested = Value::Array(vec![nested]);
        }
        let flat = flatten_pixels(&[nested]);
        assert_eq!(flat, vec![json!(7)]);
    }

    #[test]
    fn test_encode_single_red_pixel() {
        let jpeg = encode_jpeg(&[0xFF, 0x00, 0x00, 0xFF], 1, 1).unwrap();

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 1);
        assert_eq!(decoded.height(), 1);
    }

    #[test]
    fn test_encode_length_mismatch() {
        let err = encode_jpeg(&[0xFF, 0x00, 0x00], 1, 1).unwrap_err();
        assert!(matches!(
            err,
            PictureError::LengthMismatch {
                expected: 4,
                actual: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_encode_zero_dimension() {
        let err = encode_jpeg(&[], 0, 1).unwrap_err();
        assert!(matches!(err, PictureError::InvalidDimensions { .. }));
    }

    #[test]
    fn test_payload_from_array() {
        let request = PictureRequest {
            data: Some(json!([[255, 0, 0, 255]])),
            width: Some(1),
            height: Some(1),
        };

        let payload = PicturePayload::try_from(request).unwrap();
        assert!(matches!(payload, PicturePayload::RawMatrix { width: 1, .. }));
    }

    #[test]
    fn test_payload_from_string() {
        let request = PictureRequest {
            data: Some(json!("aGVsbG8=")),
            width: Some(640),
            height: Some(480),
        };

        let payload = PicturePayload::try_from(request).unwrap();
        assert_eq!(
            payload,
            PicturePayload::EncodedImage {
                encoded: "aGVsbG8=".to_string(),
                width: 640,
                height: 480,
            }
        );
    }

    #[test]
    fn test_payload_rejects_other_shapes() {
        for data in [None, Some(Value::Null), Some(json!(42)), Some(json!({"r": 1}))] {
            let request = PictureRequest {
                data,
                width: Some(1),
                height: Some(1),
            };
            assert!(matches!(
                PicturePayload::try_from(request),
                Err(PictureError::UnsupportedData)
            ));
        }
    }

    #[test]
    fn test_payload_requires_dimensions() {
        let request = PictureRequest {
            data: Some(json!([])),
            width: Some(1),
            height: None,
        };
        assert!(matches!(
            PicturePayload::try_from(request),
            Err(PictureError::MissingDimension("height"))
        ));
    }

    #[test]
    fn test_decode_raw_matrix() {
        let payload = PicturePayload::RawMatrix {
            data: values(json!([[[255, 0, 0, 255], [0, 255, 0, 255]]])),
            width: 2,
            height: 1,
        };

        let decoded = decode_picture(&payload).unwrap();
        assert_eq!((decoded.width, decoded.height), (2, 1));

        let image = image::load_from_memory(&decoded.bytes).unwrap();
        assert_eq!((image.width(), image.height()), (2, 1));
    }

    #[test]
    fn test_decode_encoded_image_keeps_bytes() {
        let original = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        let payload = PicturePayload::EncodedImage {
            encoded: STANDARD.encode(&original),
            width: 10,
            height: 20,
        };

        let decoded = decode_picture(&payload).unwrap();
        assert_eq!(decoded.bytes, original);
        assert_eq!((decoded.width, decoded.height), (10, 20));
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        let payload = PicturePayload::EncodedImage {
            encoded: "not base64!".to_string(),
            width: 1,
            height: 1,
        };
        assert!(matches!(decode_picture(&payload), Err(PictureError::Base64(_))));
    }

    #[test]
    fn test_decode_rejects_out_of_range_pixel() {
        let payload = PicturePayload::RawMatrix {
            data: values(json!([[255, 0, 256, 255]])),
            width: 1,
            height: 1,
        };

        match decode_picture(&payload) {
            Err(PictureError::InvalidPixel { index, .. }) => assert_eq!(index, 2),
            other => panic!("Expected InvalidPixel, got {:?}", other),
        }
    }
}
