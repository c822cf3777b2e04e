use base64::{engine::general_purpose, Engine as _};
use image::{DynamicImage, ImageBuffer, Pixel};
use ndarray::prelude::*;
use nshare::AsNdarray3;
use num_traits::AsPrimitive;

use crate::errors::{InstanSegError, Result};

const WRONG_DIMENSIONALITY: &str = "Array has the wrong dimensionality.";

/// Decoded input image.
///
/// Rank 2 (`H×W`) for grayscale rasters, rank 3 (`H×W×C`, channels last)
/// otherwise. The rank check lives in `TryFrom`, which is the only way to
/// build one.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageArray(ArrayD<f32>);

impl ImageArray {
    pub fn view(&self) -> ArrayViewD<'_, f32> {
        self.0.view()
    }

    pub fn ndim(&self) -> usize {
        self.0.ndim()
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    /// Height and width in pixels.
    pub fn spatial_size(&self) -> (usize, usize) {
        let shape = self.0.shape();
        (shape[0], shape[1])
    }

    pub fn into_inner(self) -> ArrayD<f32> {
        self.0
    }
}

impl TryFrom<ArrayD<f32>> for ImageArray {
    type Error = InstanSegError;

    fn try_from(array: ArrayD<f32>) -> Result<Self> {
        if !matches!(array.ndim(), 2 | 3) {
            return Err(InstanSegError::validation("image", WRONG_DIMENSIONALITY));
        }
        Ok(Self(array))
    }
}

/// Decodes a base64 encoded raster into an [`ImageArray`].
///
/// A `data:<mime>;base64,` prefix is tolerated, as are missing padding and
/// line breaks (MIME-wrapped output).
pub fn decode_contents(contents: &str) -> Result<ImageArray> {
    let payload: String = strip_data_url(contents.trim())
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    if payload.is_empty() {
        return Err(InstanSegError::validation("image", "must not be empty"));
    }

    let bytes = general_purpose::STANDARD_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| InstanSegError::validation("image", format!("invalid base64: {e}")))?;

    decode_bytes(&bytes)
        .map_err(|e| InstanSegError::validation("image", format!("cannot decode image: {e}")))
}

/// Decodes raw file bytes in any format the `image` crate is built with.
pub fn decode_bytes(bytes: &[u8]) -> Result<ImageArray> {
    let image = image::load_from_memory(bytes).map_err(|e| InstanSegError::ImageProcessing {
        path: "<memory>".to_string(),
        operation: "image decoding".to_string(),
        source: Box::new(e),
    })?;
    ImageArray::try_from(image_to_array(&image))
}

pub fn encode_bytes(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

/// Converts a raster to a numeric array, keeping the native sample range.
pub fn image_to_array(image: &DynamicImage) -> ArrayD<f32> {
    match image {
        DynamicImage::ImageLuma8(buffer) => buffer_to_array(buffer),
        DynamicImage::ImageLumaA8(buffer) => buffer_to_array(buffer),
        DynamicImage::ImageRgb8(buffer) => buffer_to_array(buffer),
        DynamicImage::ImageRgba8(buffer) => buffer_to_array(buffer),
        DynamicImage::ImageLuma16(buffer) => buffer_to_array(buffer),
        DynamicImage::ImageLumaA16(buffer) => buffer_to_array(buffer),
        DynamicImage::ImageRgb16(buffer) => buffer_to_array(buffer),
        DynamicImage::ImageRgba16(buffer) => buffer_to_array(buffer),
        DynamicImage::ImageRgb32F(buffer) => buffer_to_array(buffer),
        DynamicImage::ImageRgba32F(buffer) => buffer_to_array(buffer),
        other => buffer_to_array(&other.to_rgb32f()),
    }
}

fn buffer_to_array<P>(buffer: &ImageBuffer<P, Vec<P::Subpixel>>) -> ArrayD<f32>
where
    P: Pixel + 'static,
    P::Subpixel: AsPrimitive<f32>,
{
    // nshare yields C×H×W
    let planes = buffer.as_ndarray3();
    let array = planes
        .permuted_axes([1, 2, 0])
        .mapv(|v| -> f32 { v.as_() });
    if array.shape()[2] == 1 {
        array.index_axis_move(Axis(2), 0).into_dyn()
    } else {
        array.into_dyn()
    }
}

/// Serializes a label array as base64 of its little-endian `int32` buffer in
/// C order.
pub fn encode_array<D: Dimension>(array: &Array<i32, D>) -> String {
    let bytes: Vec<u8> = array
        .as_standard_layout()
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    general_purpose::STANDARD.encode(bytes)
}

fn strip_data_url(contents: &str) -> &str {
    match contents.split_once(";base64,") {
        Some((prefix, payload)) if prefix.starts_with("data:") => payload,
        _ => contents,
    }
}
