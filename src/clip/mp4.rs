//! Minimal ISO BMFF (MP4) muxer for JPEG video samples.
//!
//! Writes a single-track video file whose samples are the JPEG frames as-is
//! (`mp4v` sample entry, objectTypeIndication 0x6C = ISO/IEC 10918-1 JPEG).
//! Every sample is a sync sample, so the sync table is omitted entirely.
//!
//! Layout: `ftyp` | `mdat` (all samples, back to back) | `moov`. The chunk
//! offset table points at the first byte after the `mdat` header; the whole
//! file is assembled in memory because clips are bounded by the upload
//! budget anyway.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, WriteBytesExt};

const MOVIE_TIMESCALE: u32 = 1000;

/// Mux JPEG samples into an MP4 container at `fps`. All samples must share
/// the `width` x `height` geometry of the sample entry.
pub fn mux(samples: &[Vec<u8>], fps: u32, width: u16, height: u16) -> Result<Vec<u8>> {
    if samples.is_empty() {
        return Err(anyhow!("cannot mux an empty clip"));
    }
    if fps == 0 {
        return Err(anyhow!("clip frame rate must be >= 1"));
    }

    let sample_count = samples.len() as u32;
    // Media timescale = fps, one tick per sample.
    let media_duration = sample_count;
    let movie_duration = sample_count
        .saturating_mul(MOVIE_TIMESCALE)
        .checked_div(fps)
        .unwrap_or(0);

    let ftyp = boxed(b"ftyp", &{
        let mut b = Vec::new();
        b.extend_from_slice(b"isom");
        b.write_u32::<BigEndian>(512)?;
        b.extend_from_slice(b"isom");
        b.extend_from_slice(b"iso2");
        b.extend_from_slice(b"mp41");
        b
    });

    let mdat_payload_len: usize = samples.iter().map(Vec::len).sum();
    let mut mdat = Vec::with_capacity(8 + mdat_payload_len);
    mdat.write_u32::<BigEndian>((8 + mdat_payload_len) as u32)?;
    mdat.extend_from_slice(b"mdat");
    for sample in samples {
        mdat.extend_from_slice(sample);
    }

    // First sample starts right after the mdat header.
    let chunk_offset = (ftyp.len() + 8) as u32;

    let moov = boxed(b"moov", &{
        let mut b = Vec::new();
        b.extend_from_slice(&mvhd(movie_duration)?);
        b.extend_from_slice(&trak(
            samples,
            fps,
            width,
            height,
            media_duration,
            movie_duration,
            chunk_offset,
        )?);
        b
    });

    let mut out = Vec::with_capacity(ftyp.len() + mdat.len() + moov.len());
    out.extend_from_slice(&ftyp);
    out.extend_from_slice(&mdat);
    out.extend_from_slice(&moov);
    Ok(out)
}

fn boxed(name: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&((8 + payload.len()) as u32).to_be_bytes());
    out.extend_from_slice(name);
    out.extend_from_slice(payload);
    out
}

fn full_box(name: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(4 + payload.len());
    inner.push(version);
    inner.extend_from_slice(&flags.to_be_bytes()[1..]);
    inner.extend_from_slice(payload);
    boxed(name, &inner)
}

const UNITY_MATRIX: [u32; 9] = [
    0x0001_0000,
    0,
    0,
    0,
    0x0001_0000,
    0,
    0,
    0,
    0x4000_0000,
];

fn mvhd(movie_duration: u32) -> Result<Vec<u8>> {
    let mut b = Vec::new();
    b.write_u32::<BigEndian>(0)?; // creation_time
    b.write_u32::<BigEndian>(0)?; // modification_time
    b.write_u32::<BigEndian>(MOVIE_TIMESCALE)?;
    b.write_u32::<BigEndian>(movie_duration)?;
    b.write_u32::<BigEndian>(0x0001_0000)?; // rate 1.0
    b.write_u16::<BigEndian>(0x0100)?; // volume 1.0
    b.write_u16::<BigEndian>(0)?;
    b.write_u32::<BigEndian>(0)?;
    b.write_u32::<BigEndian>(0)?;
    for v in UNITY_MATRIX {
        b.write_u32::<BigEndian>(v)?;
    }
    for _ in 0..6 {
        b.write_u32::<BigEndian>(0)?; // pre_defined
    }
    b.write_u32::<BigEndian>(2)?; // next_track_ID
    Ok(full_box(b"mvhd", 0, 0, &b))
}

#[allow(clippy::too_many_arguments)]
fn trak(
    samples: &[Vec<u8>],
    fps: u32,
    width: u16,
    height: u16,
    media_duration: u32,
    movie_duration: u32,
    chunk_offset: u32,
) -> Result<Vec<u8>> {
    let tkhd = {
        let mut b = Vec::new();
        b.write_u32::<BigEndian>(0)?; // creation_time
        b.write_u32::<BigEndian>(0)?; // modification_time
        b.write_u32::<BigEndian>(1)?; // track_ID
        b.write_u32::<BigEndian>(0)?;
        b.write_u32::<BigEndian>(movie_duration)?;
        b.write_u32::<BigEndian>(0)?;
        b.write_u32::<BigEndian>(0)?;
        b.write_u16::<BigEndian>(0)?; // layer
        b.write_u16::<BigEndian>(0)?; // alternate_group
        b.write_u16::<BigEndian>(0)?; // volume (video)
        b.write_u16::<BigEndian>(0)?;
        for v in UNITY_MATRIX {
            b.write_u32::<BigEndian>(v)?;
        }
        b.write_u32::<BigEndian>((width as u32) << 16)?;
        b.write_u32::<BigEndian>((height as u32) << 16)?;
        // flags: enabled | in movie
        full_box(b"tkhd", 0, 0x3, &b)
    };

    let mdhd = {
        let mut b = Vec::new();
        b.write_u32::<BigEndian>(0)?;
        b.write_u32::<BigEndian>(0)?;
        b.write_u32::<BigEndian>(fps)?; // media timescale
        b.write_u32::<BigEndian>(media_duration)?;
        b.write_u16::<BigEndian>(0x55C4)?; // language "und"
        b.write_u16::<BigEndian>(0)?;
        full_box(b"mdhd", 0, 0, &b)
    };

    let hdlr = {
        let mut b = Vec::new();
        b.write_u32::<BigEndian>(0)?; // pre_defined
        b.extend_from_slice(b"vide");
        for _ in 0..3 {
            b.write_u32::<BigEndian>(0)?;
        }
        b.extend_from_slice(b"VideoHandler\0");
        full_box(b"hdlr", 0, 0, &b)
    };

    let stbl = stbl(samples, width, height, chunk_offset)?;

    let minf = boxed(b"minf", &{
        let mut b = Vec::new();
        // vmhd: graphicsmode copy, opcolor black; flags must be 1.
        let vmhd_payload = [0u8; 8];
        b.extend_from_slice(&full_box(b"vmhd", 0, 1, &vmhd_payload));
        // dinf/dref: single self-contained url entry.
        let url = full_box(b"url ", 0, 1, &[]);
        let mut dref_payload = Vec::new();
        dref_payload.write_u32::<BigEndian>(1)?;
        dref_payload.extend_from_slice(&url);
        let dref = full_box(b"dref", 0, 0, &dref_payload);
        b.extend_from_slice(&boxed(b"dinf", &dref));
        b.extend_from_slice(&stbl);
        b
    });

    let mdia = boxed(b"mdia", &{
        let mut b = Vec::new();
        b.extend_from_slice(&mdhd);
        b.extend_from_slice(&hdlr);
        b.extend_from_slice(&minf);
        b
    });

    Ok(boxed(b"trak", &{
        let mut b = Vec::new();
        b.extend_from_slice(&tkhd);
        b.extend_from_slice(&mdia);
        b
    }))
}

fn stbl(samples: &[Vec<u8>], width: u16, height: u16, chunk_offset: u32) -> Result<Vec<u8>> {
    let sample_count = samples.len() as u32;

    let stsd = {
        let mut b = Vec::new();
        b.write_u32::<BigEndian>(1)?; // entry_count
        b.extend_from_slice(&visual_sample_entry(width, height)?);
        full_box(b"stsd", 0, 0, &b)
    };

    let stts = {
        let mut b = Vec::new();
        b.write_u32::<BigEndian>(1)?;
        b.write_u32::<BigEndian>(sample_count)?;
        b.write_u32::<BigEndian>(1)?; // one media tick per sample
        full_box(b"stts", 0, 0, &b)
    };

    let stsc = {
        let mut b = Vec::new();
        b.write_u32::<BigEndian>(1)?;
        b.write_u32::<BigEndian>(1)?; // first_chunk
        b.write_u32::<BigEndian>(sample_count)?; // samples_per_chunk
        b.write_u32::<BigEndian>(1)?; // sample_description_index
        full_box(b"stsc", 0, 0, &b)
    };

    let stsz = {
        let mut b = Vec::new();
        b.write_u32::<BigEndian>(0)?; // variable sizes
        b.write_u32::<BigEndian>(sample_count)?;
        for sample in samples {
            b.write_u32::<BigEndian>(sample.len() as u32)?;
        }
        full_box(b"stsz", 0, 0, &b)
    };

    let stco = {
        let mut b = Vec::new();
        b.write_u32::<BigEndian>(1)?;
        b.write_u32::<BigEndian>(chunk_offset)?;
        full_box(b"stco", 0, 0, &b)
    };

    Ok(boxed(b"stbl", &{
        let mut b = Vec::new();
        b.extend_from_slice(&stsd);
        b.extend_from_slice(&stts);
        b.extend_from_slice(&stsc);
        b.extend_from_slice(&stsz);
        b.extend_from_slice(&stco);
        b
    }))
}

fn visual_sample_entry(width: u16, height: u16) -> Result<Vec<u8>> {
    let mut b = Vec::new();
    b.extend_from_slice(&[0u8; 6]); // reserved
    b.write_u16::<BigEndian>(1)?; // data_reference_index
    b.write_u16::<BigEndian>(0)?; // pre_defined
    b.write_u16::<BigEndian>(0)?; // reserved
    for _ in 0..3 {
        b.write_u32::<BigEndian>(0)?; // pre_defined
    }
    b.write_u16::<BigEndian>(width)?;
    b.write_u16::<BigEndian>(height)?;
    b.write_u32::<BigEndian>(0x0048_0000)?; // 72 dpi
    b.write_u32::<BigEndian>(0x0048_0000)?;
    b.write_u32::<BigEndian>(0)?; // reserved
    b.write_u16::<BigEndian>(1)?; // frame_count
    b.extend_from_slice(&[0u8; 32]); // compressorname
    b.write_u16::<BigEndian>(0x0018)?; // depth
    b.write_u16::<BigEndian>(0xFFFF)?; // pre_defined -1
    b.extend_from_slice(&esds()?);
    Ok(boxed(b"mp4v", &b))
}

/// Elementary stream descriptor for a JPEG visual stream: no decoder
/// specific info, just the object type.
fn esds() -> Result<Vec<u8>> {
    // DecoderConfigDescriptor (tag 0x04)
    let mut dcd = Vec::new();
    dcd.push(0x6C); // objectTypeIndication: Visual ISO/IEC 10918-1 (JPEG)
    dcd.push((0x04 << 2) | 0x01); // streamType visual, reserved bit
    dcd.extend_from_slice(&[0, 0, 0]); // bufferSizeDB
    dcd.write_u32::<BigEndian>(0)?; // maxBitrate
    dcd.write_u32::<BigEndian>(0)?; // avgBitrate

    // SLConfigDescriptor (tag 0x06), predefined MP4.
    let slc = [0x02u8];

    // ES_Descriptor (tag 0x03)
    let mut es = Vec::new();
    es.write_u16::<BigEndian>(1)?; // ES_ID
    es.push(0); // no flags
    es.push(0x04);
    es.push(dcd.len() as u8);
    es.extend_from_slice(&dcd);
    es.push(0x06);
    es.push(slc.len() as u8);
    es.extend_from_slice(&slc);

    let mut payload = Vec::new();
    payload.push(0x03);
    payload.push(es.len() as u8);
    payload.extend_from_slice(&es);
    Ok(full_box(b"esds", 0, 0, &payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Walk top-level boxes: (name, payload_range).
    fn top_level_boxes(data: &[u8]) -> Vec<(String, usize, usize)> {
        let mut out = Vec::new();
        let mut at = 0;
        while at + 8 <= data.len() {
            let size = u32::from_be_bytes(data[at..at + 4].try_into().unwrap()) as usize;
            let name = String::from_utf8_lossy(&data[at + 4..at + 8]).to_string();
            out.push((name, at + 8, at + size));
            assert!(size >= 8, "degenerate box size");
            at += size;
        }
        assert_eq!(at, data.len(), "trailing garbage after last box");
        out
    }

    fn sample_clip() -> (Vec<Vec<u8>>, Vec<u8>) {
        let samples: Vec<Vec<u8>> = (0u8..5)
            .map(|i| vec![0xFF, 0xD8, i, i, i, 0xFF, 0xD9])
            .collect();
        let mp4 = mux(&samples, 25, 64, 48).unwrap();
        (samples, mp4)
    }

    #[test]
    fn produces_ftyp_mdat_moov_in_order() {
        let (_, mp4) = sample_clip();
        let names: Vec<String> = top_level_boxes(&mp4).iter().map(|b| b.0.clone()).collect();
        assert_eq!(names, vec!["ftyp", "mdat", "moov"]);
    }

    #[test]
    fn chunk_offset_points_at_first_sample() {
        let (samples, mp4) = sample_clip();
        let boxes = top_level_boxes(&mp4);
        let (_, mdat_start, _) = boxes.iter().find(|b| b.0 == "mdat").unwrap().clone();
        // stco holds a single offset; locate it by scanning for the box name.
        let stco_at = mp4.windows(4).position(|w| w == b"stco").unwrap();
        let offset =
            u32::from_be_bytes(mp4[stco_at + 12..stco_at + 16].try_into().unwrap()) as usize;
        assert_eq!(offset, mdat_start);
        assert_eq!(&mp4[offset..offset + samples[0].len()], samples[0].as_slice());
    }

    #[test]
    fn mdat_carries_all_samples_back_to_back() {
        let (samples, mp4) = sample_clip();
        let boxes = top_level_boxes(&mp4);
        let (_, start, end) = boxes.iter().find(|b| b.0 == "mdat").unwrap().clone();
        let expected: Vec<u8> = samples.concat();
        assert_eq!(&mp4[start..end], expected.as_slice());
    }

    #[test]
    fn sample_sizes_are_recorded() {
        let (samples, mp4) = sample_clip();
        let stsz_at = mp4.windows(4).position(|w| w == b"stsz").unwrap();
        let count =
            u32::from_be_bytes(mp4[stsz_at + 12..stsz_at + 16].try_into().unwrap()) as usize;
        assert_eq!(count, samples.len());
        let first_size = u32::from_be_bytes(mp4[stsz_at + 16..stsz_at + 20].try_into().unwrap());
        assert_eq!(first_size as usize, samples[0].len());
    }

    #[test]
    fn rejects_empty_input_and_zero_fps() {
        assert!(mux(&[], 25, 64, 48).is_err());
        assert!(mux(&[vec![1, 2, 3]], 0, 64, 48).is_err());
    }
}
