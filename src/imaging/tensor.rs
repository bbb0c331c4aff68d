//! Normalized floating-point image buffer.
//!
//! [`ImageTensor`] is the currency between pipeline stages: decode produces
//! one, the tile scheduler crops views out of it, the inference runtime
//! transforms tiles, and the compositor assembles a new one. Samples are
//! interleaved RGB `f32` in `[0, 1]`, row-major (height × width × channel).

use image::{ImageBuffer, Rgb, Rgb32FImage, RgbImage};
use rayon::prelude::*;

use super::tiling::Rect;

/// Number of interleaved channels every tensor carries.
pub const CHANNELS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl ImageTensor {
    /// A black tensor of the given size.
    pub fn zeros(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width as usize * height as usize * CHANNELS],
        }
    }

    /// A tensor where every channel of every pixel is `value`.
    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self {
            width,
            height,
            data: vec![value; width as usize * height as usize * CHANNELS],
        }
    }

    /// Wrap raw interleaved samples. Returns `None` if the length doesn't
    /// match `width * height * 3`.
    pub fn from_raw(width: u32, height: u32, data: Vec<f32>) -> Option<Self> {
        (data.len() == width as usize * height as usize * CHANNELS).then_some(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_raw(self) -> Vec<f32> {
        self.data
    }

    /// The three channel values at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> [f32; CHANNELS] {
        let i = self.index(x, y);
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, value: [f32; CHANNELS]) {
        let i = self.index(x, y);
        self.data[i..i + CHANNELS].copy_from_slice(&value);
    }

    fn index(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * CHANNELS
    }

    /// Copy out the pixels inside `rect` (must lie within the tensor).
    pub fn crop(&self, rect: Rect) -> ImageTensor {
        let width = rect.width();
        let height = rect.height();
        let row_len = width as usize * CHANNELS;
        let mut data = Vec::with_capacity(row_len * height as usize);
        for y in rect.y0..rect.y1 {
            let start = self.index(rect.x0, y);
            data.extend_from_slice(&self.data[start..start + row_len]);
        }
        ImageTensor {
            width,
            height,
            data,
        }
    }

    /// Convert 8-bit RGB into a normalized tensor.
    pub fn from_rgb8(img: &RgbImage) -> Self {
        let data = img
            .as_raw()
            .par_iter()
            .map(|&v| v as f32 / 255.0)
            .collect();
        Self {
            width: img.width(),
            height: img.height(),
            data,
        }
    }

    /// Quantize back to 8-bit RGB, clamping out-of-range samples.
    pub fn to_rgb8(&self) -> RgbImage {
        let raw: Vec<u8> = self
            .data
            .par_iter()
            .map(|&v| (v * 255.0).round().clamp(0.0, 255.0) as u8)
            .collect();
        ImageBuffer::from_raw(self.width, self.height, raw)
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }

    /// View as an `image` crate float buffer (copies).
    pub fn to_rgb32f(&self) -> Rgb32FImage {
        ImageBuffer::<Rgb<f32>, Vec<f32>>::from_raw(self.width, self.height, self.data.clone())
            .unwrap_or_else(|| Rgb32FImage::new(self.width, self.height))
    }

    pub fn from_rgb32f(img: Rgb32FImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            data: img.into_raw(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_raw_checks_length() {
        assert!(ImageTensor::from_raw(2, 2, vec![0.0; 12]).is_some());
        assert!(ImageTensor::from_raw(2, 2, vec![0.0; 11]).is_none());
    }

    #[test]
    fn crop_extracts_rows() {
        let mut t = ImageTensor::zeros(4, 3);
        t.set_pixel(2, 1, [0.5, 0.25, 1.0]);
        let c = t.crop(Rect {
            x0: 1,
            y0: 1,
            x1: 4,
            y1: 3,
        });
        assert_eq!(c.dimensions(), (3, 2));
        assert_eq!(c.pixel(1, 0), [0.5, 0.25, 1.0]);
        assert_eq!(c.pixel(0, 0), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn rgb8_conversion_preserves_values() {
        let img = RgbImage::from_pixel(3, 2, Rgb([255, 0, 128]));
        let t = ImageTensor::from_rgb8(&img);
        assert_eq!(t.pixel(2, 1)[0], 1.0);
        assert_eq!(t.pixel(2, 1)[1], 0.0);
        let back = t.to_rgb8();
        assert_eq!(back.get_pixel(2, 1), &Rgb([255, 0, 128]));
    }

    #[test]
    fn to_rgb8_clamps() {
        let t = ImageTensor::filled(1, 1, 1.7);
        assert_eq!(t.to_rgb8().get_pixel(0, 0), &Rgb([255, 255, 255]));
        let t = ImageTensor::filled(1, 1, -0.3);
        assert_eq!(t.to_rgb8().get_pixel(0, 0), &Rgb([0, 0, 0]));
    }
}
