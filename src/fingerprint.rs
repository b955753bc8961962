//! Perceptual scene fingerprints.
//!
//! Collapses visually similar frames into one 16-byte dedup key regardless of
//! minor motion, lighting jitter, or re-encoding artifacts. The algorithm is
//! part of the on-disk cache contract: keys must be reproducible across
//! process restarts, so every step below is fixed.
//!
//! 1. Decode the representative frame.
//! 2. Downscale to 4x4 (area-averaging filter).
//! 3. Grayscale.
//! 4. Mean-threshold the 16 pixels into a 16-bit mask (bit set iff pixel
//!    brighter than the mean).
//! 5. Pack the mask big-endian into 2 bytes and take their MD5 digest.
//!
//! A 4x4 grid is deliberately coarse: finer grids flip bits between loop
//! positions of the same footage and split what should be one key. The
//! dedup cooldown absorbs the residual sensitivity.

use anyhow::{Context, Result};
use md5::{Digest, Md5};

/// 16-byte dedup key.
pub type FingerprintKey = [u8; 16];

const GRID: u32 = 4;
const CELLS: usize = (GRID * GRID) as usize;

/// Fingerprint a JPEG-encoded frame. Deterministic and pure.
pub fn fingerprint(jpeg: &[u8]) -> Result<FingerprintKey> {
    let image = image::load_from_memory(jpeg).context("decode representative frame")?;
    let small = image
        .resize_exact(GRID, GRID, image::imageops::FilterType::Triangle)
        .to_luma8();

    let pixels: Vec<u8> = small.pixels().map(|p| p.0[0]).collect();
    debug_assert_eq!(pixels.len(), CELLS);

    let mean = (pixels.iter().map(|&p| p as u32).sum::<u32>() / CELLS as u32) as u8;

    let mut mask: u16 = 0;
    for (i, &p) in pixels.iter().enumerate() {
        if p > mean {
            mask |= 1 << i;
        }
    }

    let digest = Md5::digest(mask.to_be_bytes());
    Ok(digest.into())
}

/// Hex form used in the cache file and in logs.
pub fn key_hex(key: &FingerprintKey) -> String {
    hex::encode(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn encode_jpeg(img: &ImageBuffer<Rgb<u8>, Vec<u8>>, quality: u8) -> Vec<u8> {
        let mut out = Vec::new();
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
        encoder
            .encode(img.as_raw(), img.width(), img.height(), image::ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    /// Half-dark half-bright scene: a stable, non-degenerate mask.
    fn split_scene(width: u32, height: u32) -> ImageBuffer<Rgb<u8>, Vec<u8>> {
        ImageBuffer::from_fn(width, height, |x, _| {
            if x < width / 2 {
                Rgb([10, 10, 10])
            } else {
                Rgb([240, 240, 240])
            }
        })
    }

    #[test]
    fn deterministic_for_same_bytes() {
        let jpeg = encode_jpeg(&split_scene(64, 48), 90);
        assert_eq!(fingerprint(&jpeg).unwrap(), fingerprint(&jpeg).unwrap());
    }

    #[test]
    fn stable_under_reencoding() {
        let scene = split_scene(64, 48);
        let high = encode_jpeg(&scene, 95);
        let low = encode_jpeg(&scene, 60);
        assert_eq!(fingerprint(&high).unwrap(), fingerprint(&low).unwrap());
    }

    #[test]
    fn stable_across_resolutions_of_same_scene() {
        let big = encode_jpeg(&split_scene(640, 480), 90);
        let small = encode_jpeg(&split_scene(160, 120), 90);
        assert_eq!(fingerprint(&big).unwrap(), fingerprint(&small).unwrap());
    }

    #[test]
    fn distinct_scenes_get_distinct_keys() {
        let left_bright = encode_jpeg(&split_scene(64, 48), 90);
        let right_bright = encode_jpeg(
            &ImageBuffer::from_fn(64, 48, |x, _| {
                if x < 32 {
                    Rgb([240, 240, 240])
                } else {
                    Rgb([10, 10, 10])
                }
            }),
            90,
        );
        assert_ne!(
            fingerprint(&left_bright).unwrap(),
            fingerprint(&right_bright).unwrap()
        );
    }

    #[test]
    fn rejects_non_jpeg_payload() {
        assert!(fingerprint(b"not an image").is_err());
    }

    #[test]
    fn key_hex_is_32_chars() {
        let jpeg = encode_jpeg(&split_scene(64, 48), 90);
        let key = fingerprint(&jpeg).unwrap();
        assert_eq!(key_hex(&key).len(), 32);
    }
}
