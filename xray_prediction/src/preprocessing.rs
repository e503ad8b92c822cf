use crate::{
    config::{ChannelMode, ResizeMode, TransformConfig},
    error::PredictionError,
};
use image::{
    imageops::{self, FilterType},
    DynamicImage, GrayImage, ImageBuffer, ImageReader, Limits, Luma, Pixel, RgbImage,
};
use ndarray::{Array, Ix4};
use std::io::Cursor;

// 4 channels of f32, the widest buffer a decoder hands back.
const MAX_BYTES_PER_PIXEL: u64 = 16;

/// Model input derived from one uploaded image, NCHW with a batch of one.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessedTensor {
    pub input: Array<f32, Ix4>,
    pub source_width: u32,
    pub source_height: u32,
}

/// Fixed preprocessing pipeline for one deployed model.
#[derive(Debug, Clone)]
pub struct Transform {
    config: TransformConfig,
}

impl Transform {
    pub fn new(config: TransformConfig) -> Result<Self, PredictionError> {
        config.validate().map_err(PredictionError::Configuration)?;
        Ok(Self { config })
    }

    pub fn input_shape(&self) -> (usize, usize, usize, usize) {
        let size = self.config.image_size as usize;
        (1, 3, size, size)
    }

    /// Width and height from the image header. Pixels are not decoded.
    pub fn image_dimensions(&self, image_data: &[u8]) -> Result<(u32, u32), PredictionError> {
        image_reader(image_data)?
            .into_dimensions()
            .map_err(|e| PredictionError::InvalidImage(format!("Error reading image: {}", e)))
    }

    /// Refuses images this pipeline cannot resize within bounded memory: too
    /// many pixels, or a shape so elongated that scaling the shorter side up
    /// would blow up the longer one.
    pub fn check_dimensions(&self, width: u32, height: u32) -> Result<(), String> {
        if width == 0 || height == 0 {
            return Err(format!("image is {}x{} pixels", width, height));
        }
        let pixels = width as u64 * height as u64;
        if pixels > self.config.max_input_pixels {
            return Err(format!(
                "image is {}x{} pixels, at most {} pixels are accepted",
                width, height, self.config.max_input_pixels
            ));
        }
        let aspect_ratio = width.max(height) as f64 / width.min(height) as f64;
        if aspect_ratio > self.config.max_aspect_ratio as f64 {
            return Err(format!(
                "image is {}x{} pixels, the longer side may be at most {} times the shorter side",
                width, height, self.config.max_aspect_ratio
            ));
        }
        Ok(())
    }

    pub fn preprocess(&self, image_data: &[u8]) -> Result<PreprocessedTensor, PredictionError> {
        let (source_width, source_height) = self.image_dimensions(image_data)?;
        self.check_dimensions(source_width, source_height)
            .map_err(PredictionError::InvalidImage)?;
        let original_img = self.decode(image_data)?;

        let size = self.config.image_size as usize;
        let mut input = Array::zeros((1, 3, size, size));

        match self.config.channels {
            ChannelMode::Grayscale => {
                let luma = to_luma_itu601(&original_img);
                let img = self.resize_and_crop(&luma);
                for (x, y, pixel) in img.enumerate_pixels() {
                    let value = pixel.0[0] as f32 / 255.;
                    for c in 0..3 {
                        input[[0, c, y as usize, x as usize]] = self.normalize(c, value);
                    }
                }
            }
            ChannelMode::Rgb => {
                let rgb = original_img.to_rgb8();
                let img = self.resize_and_crop(&rgb);
                for (x, y, pixel) in img.enumerate_pixels() {
                    for (c, channel) in pixel.0.iter().enumerate() {
                        let value = *channel as f32 / 255.;
                        input[[0, c, y as usize, x as usize]] = self.normalize(c, value);
                    }
                }
            }
        }

        Ok(PreprocessedTensor {
            input,
            source_width,
            source_height,
        })
    }

    fn decode(&self, image_data: &[u8]) -> Result<DynamicImage, PredictionError> {
        let mut limits = Limits::default();
        limits.max_alloc = Some(self.config.max_input_pixels.saturating_mul(MAX_BYTES_PER_PIXEL));

        let mut image_reader = image_reader(image_data)?;
        image_reader.limits(limits);
        image_reader
            .decode()
            .map_err(|e| PredictionError::InvalidImage(format!("Error decoding image: {}", e)))
    }

    fn normalize(&self, channel: usize, value: f32) -> f32 {
        (value - self.config.mean[channel]) / self.config.std[channel]
    }

    fn resize_and_crop<P>(&self, img: &ImageBuffer<P, Vec<u8>>) -> ImageBuffer<P, Vec<u8>>
    where
        P: Pixel<Subpixel = u8> + 'static,
    {
        let crop = self.config.image_size;
        let (width, height) = img.dimensions();

        let (new_width, new_height) = match self.config.resize_mode {
            ResizeMode::Exact => (crop, crop),
            ResizeMode::ShorterSide => {
                resized_dimensions(width, height, self.config.resize_size)
            }
        };

        let resized = imageops::resize(img, new_width, new_height, FilterType::Triangle);
        let left = center_crop_offset(new_width, crop);
        let top = center_crop_offset(new_height, crop);

        imageops::crop_imm(&resized, left, top, crop, crop).to_image()
    }
}

fn image_reader(image_data: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, PredictionError> {
    ImageReader::new(Cursor::new(image_data))
        .with_guessed_format()
        .map_err(|e| PredictionError::InvalidImage(format!("Error reading image: {}", e)))
}

/// 8-bit luma with ITU-R 601-2 weights, the conversion the classifier was
/// trained with.
fn to_luma_itu601(img: &DynamicImage) -> GrayImage {
    let rgb: RgbImage = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let l = (r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471 + 0x8000) >> 16;
        Luma([l as u8])
    })
}

/// Shorter side becomes `target`, longer side keeps the aspect ratio
/// (truncated).
fn resized_dimensions(width: u32, height: u32, target: u32) -> (u32, u32) {
    if width <= height {
        let long = (target as u64 * height as u64 / width as u64) as u32;
        (target, long)
    } else {
        let long = (target as u64 * width as u64 / height as u64) as u32;
        (long, target)
    }
}

fn center_crop_offset(side: u32, crop: u32) -> u32 {
    ((side.saturating_sub(crop)) as f64 / 2.0).round_ties_even() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};

    fn encode_png(img: DynamicImage) -> Vec<u8> {
        let mut image_data: Vec<u8> = Vec::new();
        let mut cursor = Cursor::new(&mut image_data);
        img.write_to(&mut cursor, ImageFormat::Png).unwrap();
        image_data
    }

    fn gradient_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        encode_png(DynamicImage::ImageRgb8(img))
    }

    #[test]
    fn test_preprocess_shape_and_source_dimensions() {
        let transform = Transform::new(TransformConfig::default()).unwrap();

        let tensor = transform.preprocess(&gradient_png(300, 200)).unwrap();

        assert_eq!(tensor.input.shape(), &[1, 3, 224, 224]);
        assert_eq!(tensor.source_width, 300);
        assert_eq!(tensor.source_height, 200);
    }

    #[test]
    fn test_preprocess_is_deterministic() {
        let transform = Transform::new(TransformConfig::default()).unwrap();
        let image_data = gradient_png(320, 280);

        let first = transform.preprocess(&image_data).unwrap();
        let second = transform.preprocess(&image_data).unwrap();

        let first_bits: Vec<u32> = first.input.iter().map(|v| v.to_bits()).collect();
        let second_bits: Vec<u32> = second.input.iter().map(|v| v.to_bits()).collect();
        assert_eq!(first_bits, second_bits);
    }

    #[test]
    fn test_grayscale_mode_replicates_luma_into_three_channels() {
        let config = TransformConfig::default();
        let transform = Transform::new(config.clone()).unwrap();

        let tensor = transform.preprocess(&gradient_png(256, 256)).unwrap();

        for y in (0..224).step_by(37) {
            for x in (0..224).step_by(41) {
                let raw: Vec<f32> = (0..3)
                    .map(|c| tensor.input[[0, c, y, x]] * config.std[c] + config.mean[c])
                    .collect();
                assert!((raw[0] - raw[1]).abs() < 1e-5);
                assert!((raw[1] - raw[2]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_uniform_image_is_normalized_per_channel() {
        let config = TransformConfig {
            channels: ChannelMode::Rgb,
            ..TransformConfig::default()
        };
        let transform = Transform::new(config.clone()).unwrap();
        let img = RgbImage::from_pixel(240, 240, Rgb([255, 0, 255]));

        let tensor = transform
            .preprocess(&encode_png(DynamicImage::ImageRgb8(img)))
            .unwrap();

        let expected = [
            (1.0 - config.mean[0]) / config.std[0],
            (0.0 - config.mean[1]) / config.std[1],
            (1.0 - config.mean[2]) / config.std[2],
        ];
        for (c, value) in expected.iter().enumerate() {
            assert!((tensor.input[[0, c, 0, 0]] - value).abs() < 1e-5);
            assert!((tensor.input[[0, c, 223, 223]] - value).abs() < 1e-5);
        }
    }

    #[test]
    fn test_luma_conversion_matches_itu601() {
        let img = RgbImage::from_pixel(1, 1, Rgb([255, 0, 0]));
        let luma = to_luma_itu601(&DynamicImage::ImageRgb8(img));
        assert_eq!(luma.get_pixel(0, 0).0[0], 76);

        let img = RgbImage::from_pixel(1, 1, Rgb([90, 90, 90]));
        let luma = to_luma_itu601(&DynamicImage::ImageRgb8(img));
        assert_eq!(luma.get_pixel(0, 0).0[0], 90);
    }

    #[test]
    fn test_exact_resize_mode() {
        let config = TransformConfig {
            channels: ChannelMode::Rgb,
            resize_mode: ResizeMode::Exact,
            ..TransformConfig::default()
        };
        let transform = Transform::new(config).unwrap();

        let tensor = transform.preprocess(&gradient_png(500, 120)).unwrap();

        assert_eq!(tensor.input.shape(), &[1, 3, 224, 224]);
    }

    #[test]
    fn test_resize_and_crop_geometry() {
        assert_eq!(resized_dimensions(300, 200, 255), (382, 255));
        assert_eq!(resized_dimensions(200, 300, 255), (255, 382));
        assert_eq!(resized_dimensions(224, 224, 255), (255, 255));

        assert_eq!(center_crop_offset(255, 224), 16);
        assert_eq!(center_crop_offset(382, 224), 79);
        assert_eq!(center_crop_offset(224, 224), 0);
    }

    #[test]
    fn test_elongated_image_is_refused_before_resizing() {
        let transform = Transform::new(TransformConfig::default()).unwrap();
        let image_data = encode_png(DynamicImage::ImageLuma8(GrayImage::new(1, 20_000)));

        assert_eq!(transform.image_dimensions(&image_data).unwrap(), (1, 20_000));
        let err = transform.preprocess(&image_data).unwrap_err();

        assert!(matches!(err, PredictionError::InvalidImage(_)));
    }

    #[test]
    fn test_dimension_limits() {
        let transform = Transform::new(TransformConfig {
            max_input_pixels: 1_000_000,
            max_aspect_ratio: 4.0,
            ..TransformConfig::default()
        })
        .unwrap();

        assert!(transform.check_dimensions(1000, 1000).is_ok());
        assert!(transform.check_dimensions(1000, 250).is_ok());
        assert!(transform.check_dimensions(1001, 1000).is_err());
        assert!(transform.check_dimensions(1000, 249).is_err());
        assert!(transform.check_dimensions(0, 10).is_err());
    }

    #[test]
    fn test_undecodable_bytes_are_invalid_image() {
        let transform = Transform::new(TransformConfig::default()).unwrap();

        let err = transform.preprocess(b"definitely not an image").unwrap_err();

        assert!(matches!(err, PredictionError::InvalidImage(_)));
        assert!(err.is_client_fault());
    }
}
