use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};

/// Smallest bound accepted for the longest image side.
const MIN_VISION_DIM: u32 = 128;

/// Flattens alpha onto white, fits the image inside `max_dim` and re-encodes it
/// as JPEG. Bytes that do not decode are passed through with their declared type.
pub(crate) fn prepare_vision_image(
    bytes: &[u8],
    content_type: &str,
    max_dim: u32,
) -> (Vec<u8>, String) {
    let dim = max_dim.max(MIN_VISION_DIM);
    if let Ok(image) = image::load_from_memory(bytes) {
        let rgba = image.to_rgba8();
        let mut flattened = RgbaImage::new(rgba.width(), rgba.height());
        for (x, y, pixel) in rgba.enumerate_pixels() {
            let alpha = u16::from(pixel[3]);
            let blend = |channel: u8| -> u8 {
                (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
            };
            flattened.put_pixel(
                x,
                y,
                Rgba([blend(pixel[0]), blend(pixel[1]), blend(pixel[2]), 255]),
            );
        }
        let mut flattened = DynamicImage::ImageRgba8(flattened);
        if flattened.width() > dim || flattened.height() > dim {
            flattened = flattened.resize(dim, dim, FilterType::Triangle);
        }
        let rgb = flattened.to_rgb8();
        let mut encoded = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut encoded, 90);
        if encoder.encode_image(&DynamicImage::ImageRgb8(rgb)).is_ok() {
            return (encoded, "image/jpeg".to_string());
        }
    }
    (bytes.to_vec(), content_type.trim().to_string())
}

pub(crate) fn data_url(bytes: &[u8], mime: &str) -> String {
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};

    use super::{data_url, prepare_vision_image};

    fn png(width: u32, height: u32) -> anyhow::Result<Vec<u8>> {
        let image = RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 0]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(image).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(bytes)
    }

    #[test]
    fn large_images_are_downscaled_to_jpeg() -> anyhow::Result<()> {
        let (bytes, mime) = prepare_vision_image(&png(600, 300)?, "image/png", 200);
        assert_eq!(mime, "image/jpeg");
        let decoded = image::load_from_memory(&bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (200, 100));
        Ok(())
    }

    #[test]
    fn transparent_pixels_become_white() -> anyhow::Result<()> {
        let (bytes, _) = prepare_vision_image(&png(8, 8)?, "image/png", 2048);
        let decoded = image::load_from_memory(&bytes)?.to_rgb8();
        let pixel = decoded.get_pixel(4, 4);
        assert!(pixel.0.iter().all(|channel| *channel > 240), "{pixel:?}");
        assert_eq!((decoded.width(), decoded.height()), (8, 8));
        Ok(())
    }

    #[test]
    fn undecodable_bytes_pass_through() {
        let (bytes, mime) = prepare_vision_image(b"not an image", "image/heic", 512);
        assert_eq!(bytes, b"not an image".to_vec());
        assert_eq!(mime, "image/heic");
    }

    #[test]
    fn data_url_embeds_base64() {
        assert_eq!(data_url(b"abc", "image/png"), "data:image/png;base64,YWJj");
    }
}
