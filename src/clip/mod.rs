//! Evidence clip assembly.
//!
//! Turns the long-window snapshot captured at detection time into a single
//! MP4 the alert can link to. Each frame gets a small timestamp overlay
//! before encoding, and the result must come in under the per-channel upload
//! budget: over-budget clips are re-assembled stepwise at reduced resolution
//! (0.9x, 0.8x, ...) and frame rate until under budget or the floor (10 fps,
//! 0.6x) is reached. Hitting the floor still over budget is allowed; the
//! publisher decides whether to accept the oversized clip.
//!
//! Frames are processed one at a time (decode, scale, overlay, re-encode,
//! append as an MP4 sample) so peak memory stays at one decoded frame plus
//! the growing container.

pub mod mp4;

use anyhow::{anyhow, Result};
use image::{imageops, RgbImage};
use std::sync::Arc;

use crate::Frame;

const JPEG_QUALITY: u8 = 80;
const MIN_FPS: u32 = 10;
const MIN_SCALE: f64 = 0.6;

/// One finished container plus the parameters that produced it.
pub struct AssembledClip {
    pub mp4: Vec<u8>,
    pub frame_count: usize,
    pub fps: u32,
    pub width: u16,
    pub height: u16,
    /// Resolution factor relative to the source frames.
    pub scale: f64,
    pub duration_s: f64,
    /// True when even the floor parameters could not satisfy the budget.
    pub oversized: bool,
}

impl AssembledClip {
    pub fn byte_size(&self) -> usize {
        self.mp4.len()
    }
}

/// Assemble `frames` into an MP4 at `fps`, staying under `max_bytes` when
/// possible.
pub fn assemble(frames: &[Arc<Frame>], fps: u32, max_bytes: usize) -> Result<AssembledClip> {
    if frames.is_empty() {
        return Err(anyhow!("no frames to assemble"));
    }
    let fps = fps.max(1);

    let mut last: Option<AssembledClip> = None;
    for (scale, attempt_fps) in budget_ladder(fps) {
        let clip = assemble_once(frames, fps, attempt_fps, scale)?;
        let within = clip.byte_size() <= max_bytes;
        log::debug!(
            "clip attempt scale={:.1} fps={} bytes={} within_budget={}",
            scale,
            attempt_fps,
            clip.byte_size(),
            within
        );
        if within {
            return Ok(clip);
        }
        last = Some(clip);
    }

    let mut clip = last.expect("budget ladder is never empty");
    log::warn!(
        "clip still over budget at floor ({} bytes > {} bytes), returning oversized",
        clip.byte_size(),
        max_bytes
    );
    clip.oversized = true;
    Ok(clip)
}

/// (scale, fps) attempts from full quality down to the floor.
fn budget_ladder(fps: u32) -> Vec<(f64, u32)> {
    let min_fps = MIN_FPS.min(fps);
    let reduced_fps = (fps * 2 / 3).max(min_fps);
    let mut ladder = vec![
        (1.0, fps),
        (0.9, fps),
        (0.8, fps),
        (0.8, reduced_fps),
        (0.7, reduced_fps),
        (MIN_SCALE, min_fps),
    ];
    ladder.dedup();
    ladder
}

fn assemble_once(
    frames: &[Arc<Frame>],
    source_fps: u32,
    target_fps: u32,
    scale: f64,
) -> Result<AssembledClip> {
    // Frame-rate reduction is frame dropping: keep every step-th frame.
    let step = (source_fps as usize).div_ceil(target_fps as usize).max(1);
    let kept: Vec<&Arc<Frame>> = frames.iter().step_by(step).collect();
    let effective_fps = ((source_fps as f64 / step as f64).round() as u32).max(1);

    let mut samples: Vec<Vec<u8>> = Vec::with_capacity(kept.len());
    let mut geometry: Option<(u16, u16)> = None;

    for frame in &kept {
        let decoded = match image::load_from_memory(&frame.jpeg) {
            Ok(img) => img.to_rgb8(),
            Err(err) => {
                log::warn!("skipping undecodable frame seq={}: {}", frame.seq, err);
                continue;
            }
        };

        let mut rgb = if scale < 1.0 {
            let w = ((decoded.width() as f64 * scale) as u32).max(16);
            let h = ((decoded.height() as f64 * scale) as u32).max(16);
            imageops::resize(&decoded, w, h, imageops::FilterType::Triangle)
        } else {
            decoded
        };

        // Geometry is pinned by the first decodable frame; stragglers with a
        // different size are letterboxed by resize.
        let (w, h) = *geometry.get_or_insert((rgb.width() as u16, rgb.height() as u16));
        if rgb.width() != w as u32 || rgb.height() != h as u32 {
            rgb = imageops::resize(&rgb, w as u32, h as u32, imageops::FilterType::Triangle);
        }

        overlay_timestamp(&mut rgb, &timestamp_text(frame.captured_at));

        let mut jpeg = Vec::new();
        let mut encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY);
        encoder.encode(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            image::ExtendedColorType::Rgb8,
        )?;
        samples.push(jpeg);
    }

    let (width, height) =
        geometry.ok_or_else(|| anyhow!("no decodable frames in the captured window"))?;
    let frame_count = samples.len();
    let mp4 = mp4::mux(&samples, effective_fps, width, height)?;

    Ok(AssembledClip {
        mp4,
        frame_count,
        fps: effective_fps,
        width,
        height,
        scale,
        duration_s: frame_count as f64 / effective_fps as f64,
        oversized: false,
    })
}

fn timestamp_text(epoch_s: f64) -> String {
    let secs = epoch_s.floor() as i64;
    match chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => String::from("----------"),
    }
}

// -------------------- Timestamp overlay --------------------

const GLYPH_W: u32 = 5;
const GLYPH_H: u32 = 7;
const GLYPH_SCALE: u32 = 2;
const PAD: u32 = 4;

/// 5x7 glyph rows, MSB = leftmost column. Only the characters the timestamp
/// format emits.
fn glyph(c: char) -> Option<[u8; 7]> {
    Some(match c {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        ' ' => [0x00; 7],
        _ => return None,
    })
}

/// Draw `text` in a dimmed band at the bottom-left corner. Frames too small
/// to carry the band are left untouched.
fn overlay_timestamp(img: &mut RgbImage, text: &str) {
    let cell_w = (GLYPH_W + 1) * GLYPH_SCALE;
    let band_h = GLYPH_H * GLYPH_SCALE + 2 * PAD;
    let band_w = text.chars().count() as u32 * cell_w + 2 * PAD;
    if img.height() < band_h || img.width() < band_w {
        return;
    }

    let band_top = img.height() - band_h;
    for y in band_top..img.height() {
        for x in 0..band_w {
            let p = img.get_pixel_mut(x, y);
            p.0 = [p.0[0] / 3, p.0[1] / 3, p.0[2] / 3];
        }
    }

    let mut pen_x = PAD;
    let pen_y = band_top + PAD;
    for c in text.chars() {
        if let Some(rows) = glyph(c) {
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..GLYPH_W {
                    if bits & (1 << (GLYPH_W - 1 - col)) != 0 {
                        for dy in 0..GLYPH_SCALE {
                            for dx in 0..GLYPH_SCALE {
                                let x = pen_x + col * GLYPH_SCALE + dx;
                                let y = pen_y + row as u32 * GLYPH_SCALE + dy;
                                img.put_pixel(x, y, image::Rgb([255, 255, 255]));
                            }
                        }
                    }
                }
            }
        }
        pen_x += cell_w;
    }
}
