//! Image preprocessing: decode, resize, and normalize into the planar float
//! layout the classifier expects.

use image::imageops::FilterType;
use image::{ImageError, RgbaImage};
use ndarray::Array4;
use thiserror::Error;

/// Classifier input resolution
pub const INPUT_WIDTH: u32 = 256;
pub const INPUT_HEIGHT: u32 = 256;

/// Upload could not be turned into pixels; always the caller's fault
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("uploaded file is empty")]
    Empty,

    #[error("unsupported image format")]
    Unsupported,

    #[error("image data is corrupt: {0}")]
    Corrupt(String),
}

/// Decoded RGBA image
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    image: RgbaImage,
}

impl PixelBuffer {
    pub fn from_rgba(image: RgbaImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        self.image.get_pixel(x, y).0
    }
}

/// Float buffer of shape `[1, 3, H, W]`, channel-major (R, G, B planes)
#[derive(Debug, Clone)]
pub struct InputTensor {
    data: Array4<f32>,
}

impl InputTensor {
    pub fn shape(&self) -> [usize; 4] {
        let s = self.data.shape();
        [s[0], s[1], s[2], s[3]]
    }

    /// Flat view; plane `c` starts at `c * H * W`, pixel `(x, y)` sits at `y * W + x` within it
    pub fn as_slice(&self) -> &[f32] {
        // Built with Array4::zeros, so always standard layout
        self.data.as_slice().unwrap_or(&[])
    }

    pub fn into_array(self) -> Array4<f32> {
        self.data
    }
}

/// Decode PNG, JPEG, or any other raster format the `image` crate recognizes
pub fn decode(bytes: &[u8]) -> Result<PixelBuffer, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let format = image::guess_format(bytes).map_err(|_| DecodeError::Unsupported)?;
    let decoded = image::load_from_memory_with_format(bytes, format).map_err(|e| match e {
        ImageError::Unsupported(_) => DecodeError::Unsupported,
        other => DecodeError::Corrupt(other.to_string()),
    })?;

    Ok(PixelBuffer::from_rgba(decoded.to_rgba8()))
}

/// Lanczos3 resample; identical input always yields identical output
pub fn resize(buffer: &PixelBuffer, width: u32, height: u32) -> PixelBuffer {
    PixelBuffer::from_rgba(image::imageops::resize(
        &buffer.image,
        width,
        height,
        FilterType::Lanczos3,
    ))
}

/// Drop alpha and scale each 8-bit sample to `[0, 1]`
pub fn normalize(buffer: &PixelBuffer) -> InputTensor {
    let width = buffer.width() as usize;
    let height = buffer.height() as usize;
    let mut data = Array4::<f32>::zeros((1, 3, height, width));

    for (x, y, pixel) in buffer.image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for channel in 0..3 {
            data[[0, channel, y, x]] = pixel[channel] as f32 / 255.0;
        }
    }

    InputTensor { data }
}

/// Full preprocessing chain at the classifier resolution
pub fn prepare(bytes: &[u8]) -> Result<InputTensor, DecodeError> {
    let decoded = decode(bytes)?;
    let resized = resize(&decoded, INPUT_WIDTH, INPUT_HEIGHT);
    Ok(normalize(&resized))
}
