use half::f16;
use rayon::prelude::*;

use crate::common::saturate;
use crate::error::SplatError;
use crate::morton::splat_index_to_texel;
use crate::structures::{
    ColorBlockCodec, ColorFormat, InputSplat, ShFormat, VectorFormat, COLOR_TEXTURE_WIDTH,
    SH_COEFF_COUNT,
};

/// All emitted buffers are padded up to a multiple of 8 bytes.
#[inline]
pub const fn round_buffer_size(size: usize) -> usize {
    (size + 7) & !7
}

// ---------------------------------------------------------------------------
// Per-element packers. Inputs must be pre-saturated to [0,1]; rounding is
// "round half up" via the +0.5 folded into each multiplier, truncated.
// Overflow into adjacent bit fields is impossible for saturated inputs.
// ---------------------------------------------------------------------------

#[inline]
pub fn encode_norm16(v: [f32; 3]) -> [u8; 6] {
    let x = (saturate(v[0]) * 65535.5) as u32 as u16;
    let y = (saturate(v[1]) * 65535.5) as u32 as u16;
    let z = (saturate(v[2]) * 65535.5) as u32 as u16;
    let mut out = [0u8; 6];
    out[0..2].copy_from_slice(&x.to_le_bytes());
    out[2..4].copy_from_slice(&y.to_le_bytes());
    out[4..6].copy_from_slice(&z.to_le_bytes());
    out
}

#[inline]
pub fn decode_norm16(bytes: [u8; 6]) -> [f32; 3] {
    let x = u16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 65535.0;
    let y = u16::from_le_bytes([bytes[2], bytes[3]]) as f32 / 65535.0;
    let z = u16::from_le_bytes([bytes[4], bytes[5]]) as f32 / 65535.0;
    [x, y, z]
}

/// 11.10.11 bits in one word; the asymmetric split favors x/z.
#[inline]
pub fn encode_norm11(v: [f32; 3]) -> u32 {
    let x = (saturate(v[0]) * 2047.5) as u32;
    let y = (saturate(v[1]) * 1023.5) as u32;
    let z = (saturate(v[2]) * 2047.5) as u32;
    x | (y << 11) | (z << 21)
}

#[inline]
pub fn decode_norm11(packed: u32) -> [f32; 3] {
    [
        (packed & 0x7FF) as f32 / 2047.0,
        ((packed >> 11) & 0x3FF) as f32 / 1023.0,
        ((packed >> 21) & 0x7FF) as f32 / 2047.0,
    ]
}

/// 6.5.5 bits in one 16-bit word.
#[inline]
pub fn encode_norm6(v: [f32; 3]) -> u16 {
    let x = (saturate(v[0]) * 63.5) as u16;
    let y = (saturate(v[1]) * 31.5) as u16;
    let z = (saturate(v[2]) * 31.5) as u16;
    x | (y << 6) | (z << 11)
}

#[inline]
pub fn decode_norm6(packed: u16) -> [f32; 3] {
    [
        (packed & 0x3F) as f32 / 63.0,
        ((packed >> 6) & 0x1F) as f32 / 31.0,
        ((packed >> 11) & 0x1F) as f32 / 31.0,
    ]
}

// ---------------------------------------------------------------------------
// Rotation: smallest-three encoding, always packed 10.10.10.2.
// ---------------------------------------------------------------------------

/// Drops the largest-magnitude quaternion component and remaps the other
/// three from [-1/sqrt(2), 1/sqrt(2)] to [0,1]; the fourth slot holds the
/// dropped component's index as idx/3.
pub fn pack_smallest_three(q: [f32; 4]) -> [f32; 4] {
    let norm = (q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]).sqrt();
    let mut q = if norm > 0.0 {
        [q[0] / norm, q[1] / norm, q[2] / norm, q[3] / norm]
    } else {
        [0.0, 0.0, 0.0, 1.0]
    };

    let mut idx = 0;
    for a in 1..4 {
        if q[a].abs() > q[idx].abs() {
            idx = a;
        }
    }
    // q and -q are the same rotation; force the dropped component positive.
    if q[idx] < 0.0 {
        for v in q.iter_mut() {
            *v = -*v;
        }
    }

    let mut three = [0.0f32; 3];
    let mut w = 0;
    for a in 0..4 {
        if a != idx {
            three[w] = q[a] * std::f32::consts::SQRT_2 * 0.5 + 0.5;
            w += 1;
        }
    }
    [three[0], three[1], three[2], idx as f32 / 3.0]
}

pub fn unpack_smallest_three(packed: [f32; 4]) -> [f32; 4] {
    let idx = (packed[3] * 3.0).round() as usize;
    let mut q = [0.0f32; 4];
    let mut r = 0;
    let mut sum_sq = 0.0f32;
    for a in 0..4 {
        if a != idx {
            let v = (packed[r] - 0.5) * std::f32::consts::SQRT_2;
            q[a] = v;
            sum_sq += v * v;
            r += 1;
        }
    }
    q[idx] = (1.0 - sum_sq).max(0.0).sqrt();
    q
}

#[inline]
pub fn encode_quat_10_10_10_2(q01: [f32; 4]) -> u32 {
    let x = (saturate(q01[0]) * 1023.5) as u32;
    let y = (saturate(q01[1]) * 1023.5) as u32;
    let z = (saturate(q01[2]) * 1023.5) as u32;
    let w = (saturate(q01[3]) * 3.5) as u32;
    x | (y << 10) | (z << 20) | (w << 30)
}

#[inline]
pub fn decode_quat_10_10_10_2(packed: u32) -> [f32; 4] {
    [
        (packed & 0x3FF) as f32 / 1023.0,
        ((packed >> 10) & 0x3FF) as f32 / 1023.0,
        ((packed >> 20) & 0x3FF) as f32 / 1023.0,
        (packed >> 30) as f32 / 3.0,
    ]
}

// ---------------------------------------------------------------------------
// Buffer creators and their size math. The calc_* functions must agree
// exactly with the byte length the corresponding creator writes.
// ---------------------------------------------------------------------------

pub fn calc_pos_data_size(splat_count: usize, format: VectorFormat) -> usize {
    round_buffer_size(splat_count * format.stride())
}

pub fn calc_other_data_size(
    splat_count: usize,
    scale_format: VectorFormat,
    sh_clustered: bool,
) -> usize {
    let stride = 4 + scale_format.stride() + if sh_clustered { 2 } else { 0 };
    round_buffer_size(splat_count * stride)
}

/// Fixed-width texture; height in whole 16-texel tile rows.
pub fn calc_color_texture_size(splat_count: usize) -> (usize, usize) {
    let rows = splat_count.div_ceil(COLOR_TEXTURE_WIDTH);
    (COLOR_TEXTURE_WIDTH, rows.div_ceil(16) * 16)
}

pub fn calc_color_data_size(splat_count: usize, format: ColorFormat) -> usize {
    let (w, h) = calc_color_texture_size(splat_count);
    round_buffer_size(w * h * format.bytes_per_pixel())
}

pub fn calc_sh_data_size(splat_count: usize, format: ShFormat) -> usize {
    match format.cluster_count() {
        Some(k) => round_buffer_size(k * ShFormat::CLUSTER_STRIDE),
        None => round_buffer_size(splat_count * format.splat_stride()),
    }
}

#[inline]
fn write_f32(out: &mut [u8], offset: usize, v: f32) {
    out[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn write_f16(out: &mut [u8], offset: usize, v: f32) {
    out[offset..offset + 2].copy_from_slice(&f16::from_f32(v).to_bits().to_le_bytes());
}

#[inline]
fn write_vector(format: VectorFormat, v: [f32; 3], out: &mut [u8]) {
    match format {
        VectorFormat::Float32 => {
            write_f32(out, 0, v[0]);
            write_f32(out, 4, v[1]);
            write_f32(out, 8, v[2]);
        }
        VectorFormat::Norm16 => out[0..6].copy_from_slice(&encode_norm16(v)),
        VectorFormat::Norm11 => out[0..4].copy_from_slice(&encode_norm11(v).to_le_bytes()),
        VectorFormat::Norm6 => out[0..2].copy_from_slice(&encode_norm6(v).to_le_bytes()),
    }
}

pub fn create_pos_data(splats: &[InputSplat], format: VectorFormat) -> Vec<u8> {
    let stride = format.stride();
    let mut out = vec![0u8; calc_pos_data_size(splats.len(), format)];
    out[..splats.len() * stride]
        .par_chunks_mut(stride)
        .zip(splats.par_iter())
        .with_min_len(4096)
        .for_each(|(dst, s)| write_vector(format, s.pos, dst));
    out
}

/// Per splat: 4-byte packed rotation, packed scale, then the optional
/// 2-byte SH cluster index.
pub fn create_other_data(
    splats: &[InputSplat],
    scale_format: VectorFormat,
    sh_labels: Option<&[u32]>,
) -> Vec<u8> {
    let scale_stride = scale_format.stride();
    let stride = 4 + scale_stride + if sh_labels.is_some() { 2 } else { 0 };
    let mut out = vec![0u8; calc_other_data_size(splats.len(), scale_format, sh_labels.is_some())];
    out[..splats.len() * stride]
        .par_chunks_mut(stride)
        .enumerate()
        .with_min_len(4096)
        .for_each(|(i, dst)| {
            let s = &splats[i];
            let rot = encode_quat_10_10_10_2(pack_smallest_three(s.rot));
            dst[0..4].copy_from_slice(&rot.to_le_bytes());
            write_vector(scale_format, s.scale, &mut dst[4..4 + scale_stride]);
            if let Some(labels) = sh_labels {
                let off = 4 + scale_stride;
                dst[off..off + 2].copy_from_slice(&(labels[i] as u16).to_le_bytes());
            }
        });
    out
}

/// Lays the per-splat colors (dc rgb + opacity) into the fixed-width 2D
/// texture using the 16x16 tile swizzle, then packs or block-compresses.
pub fn create_color_data(
    splats: &[InputSplat],
    format: ColorFormat,
    codec: Option<&dyn ColorBlockCodec>,
) -> Result<(Vec<u8>, usize, usize), SplatError> {
    let (width, height) = calc_color_texture_size(splats.len());

    if format == ColorFormat::Bc7 {
        let codec = codec.ok_or_else(|| {
            SplatError::Config("BC7 color format requires an external block codec".to_string())
        })?;
        let mut rgba = vec![0.0f32; width * height * 4];
        for (i, s) in splats.iter().enumerate() {
            let (x, y) = splat_index_to_texel(i, width);
            let off = (y * width + x) * 4;
            rgba[off..off + 3].copy_from_slice(&s.dc);
            rgba[off + 3] = s.opacity;
        }
        let blocks = codec.encode(width, height, &rgba);
        let expected = width * height * format.bytes_per_pixel();
        if blocks.len() != expected {
            return Err(SplatError::Config(format!(
                "block codec produced {} bytes, expected {}",
                blocks.len(),
                expected
            )));
        }
        let mut out = blocks;
        out.resize(round_buffer_size(out.len()), 0);
        return Ok((out, width, height));
    }

    let bpp = format.bytes_per_pixel();
    let mut out = vec![0u8; calc_color_data_size(splats.len(), format)];
    for (i, s) in splats.iter().enumerate() {
        let (x, y) = splat_index_to_texel(i, width);
        let off = (y * width + x) * bpp;
        let px = [s.dc[0], s.dc[1], s.dc[2], s.opacity];
        match format {
            ColorFormat::Float32x4 => {
                for (c, &v) in px.iter().enumerate() {
                    write_f32(&mut out, off + c * 4, v);
                }
            }
            ColorFormat::Float16x4 => {
                for (c, &v) in px.iter().enumerate() {
                    write_f16(&mut out, off + c * 2, v);
                }
            }
            ColorFormat::Norm8x4 => {
                for (c, &v) in px.iter().enumerate() {
                    out[off + c] = (saturate(v) * 255.5) as u8;
                }
            }
            ColorFormat::Bc7 => unreachable!("handled above"),
        }
    }
    Ok((out, width, height))
}

fn write_sh_record(format: ShFormat, sh: &[f32], dst: &mut [u8]) {
    match format {
        ShFormat::Float32 => {
            for (c, &v) in sh.iter().enumerate() {
                write_f32(dst, c * 4, v);
            }
        }
        ShFormat::Float16 => {
            for (c, &v) in sh.iter().enumerate() {
                write_f16(dst, c * 2, v);
            }
        }
        ShFormat::Norm11 => {
            for c in 0..SH_COEFF_COUNT {
                let packed = encode_norm11([sh[c * 3], sh[c * 3 + 1], sh[c * 3 + 2]]);
                dst[c * 4..c * 4 + 4].copy_from_slice(&packed.to_le_bytes());
            }
        }
        ShFormat::Norm6 => {
            for c in 0..SH_COEFF_COUNT {
                let packed = encode_norm6([sh[c * 3], sh[c * 3 + 1], sh[c * 3 + 2]]);
                dst[c * 2..c * 2 + 2].copy_from_slice(&packed.to_le_bytes());
            }
        }
        _ => {}
    }
}

/// Either N per-splat SH records, or the shared float16 codebook when the
/// splats were clustered (`cluster_means` holds k*45 raw coefficients).
pub fn create_sh_data(
    splats: &[InputSplat],
    format: ShFormat,
    cluster_means: Option<&[f32]>,
) -> Vec<u8> {
    if let Some(means) = cluster_means {
        let k = means.len() / (SH_COEFF_COUNT * 3);
        let mut out = vec![0u8; round_buffer_size(k * ShFormat::CLUSTER_STRIDE)];
        out[..k * ShFormat::CLUSTER_STRIDE]
            .par_chunks_mut(ShFormat::CLUSTER_STRIDE)
            .zip(means.par_chunks(SH_COEFF_COUNT * 3))
            .for_each(|(dst, row)| {
                for (c, &v) in row.iter().enumerate() {
                    write_f16(dst, c * 2, v);
                }
            });
        return out;
    }

    let stride = format.splat_stride();
    debug_assert!(stride > 0, "clustered SH format without a codebook");
    let mut out = vec![0u8; calc_sh_data_size(splats.len(), format)];
    out[..splats.len() * stride]
        .par_chunks_mut(stride)
        .zip(splats.par_iter())
        .with_min_len(1024)
        .for_each(|(dst, s)| write_sh_record(format, &s.sh, dst));
    out
}
