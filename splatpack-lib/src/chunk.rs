use rayon::prelude::*;

use crate::common::{pack_half2, transform_opacity, transform_scale};
use crate::structures::{ChunkInfo, InputSplat, CHUNK_SPLAT_COUNT};

/// Minimum bound width; keeps the later `(v - min) / (max - min)` remap away
/// from zero-width division.
const BOUNDS_EPSILON: f32 = 1.0e-5;

#[inline]
fn widen(min: f32, max: f32) -> (f32, f32) {
    if max - min < BOUNDS_EPSILON {
        (min, min + BOUNDS_EPSILON)
    } else {
        (min, max)
    }
}

#[inline]
fn remap(v: f32, min: f32, max: f32) -> f32 {
    (v - min) / (max - min)
}

/// Normalizes one chunk in place and returns its bounds record.
fn normalize_chunk(chunk: &mut [InputSplat]) -> ChunkInfo {
    // Pre-transforms, applied before bounds are measured. Both are strictly
    // monotonic and invertible.
    for s in chunk.iter_mut() {
        for a in 0..3 {
            s.scale[a] = transform_scale(s.scale[a]);
        }
        s.opacity = transform_opacity(s.opacity);
    }

    let mut pos_min = [f32::MAX; 3];
    let mut pos_max = [f32::MIN; 3];
    let mut scl_min = [f32::MAX; 3];
    let mut scl_max = [f32::MIN; 3];
    let mut col_min = [f32::MAX; 4];
    let mut col_max = [f32::MIN; 4];
    // One shared bound across all 45 SH scalars of the chunk; this trades
    // precision for a 10x smaller bounds table and matches the wire format.
    let mut sh_min = f32::MAX;
    let mut sh_max = f32::MIN;

    for s in chunk.iter() {
        for a in 0..3 {
            pos_min[a] = pos_min[a].min(s.pos[a]);
            pos_max[a] = pos_max[a].max(s.pos[a]);
            scl_min[a] = scl_min[a].min(s.scale[a]);
            scl_max[a] = scl_max[a].max(s.scale[a]);
            col_min[a] = col_min[a].min(s.dc[a]);
            col_max[a] = col_max[a].max(s.dc[a]);
        }
        col_min[3] = col_min[3].min(s.opacity);
        col_max[3] = col_max[3].max(s.opacity);
        for &v in s.sh.iter() {
            sh_min = sh_min.min(v);
            sh_max = sh_max.max(v);
        }
    }

    for a in 0..3 {
        (pos_min[a], pos_max[a]) = widen(pos_min[a], pos_max[a]);
        (scl_min[a], scl_max[a]) = widen(scl_min[a], scl_max[a]);
    }
    for a in 0..4 {
        (col_min[a], col_max[a]) = widen(col_min[a], col_max[a]);
    }
    (sh_min, sh_max) = widen(sh_min, sh_max);

    for s in chunk.iter_mut() {
        for a in 0..3 {
            s.pos[a] = remap(s.pos[a], pos_min[a], pos_max[a]);
            s.scale[a] = remap(s.scale[a], scl_min[a], scl_max[a]);
            s.dc[a] = remap(s.dc[a], col_min[a], col_max[a]);
        }
        s.opacity = remap(s.opacity, col_min[3], col_max[3]);
        for v in s.sh.iter_mut() {
            *v = remap(*v, sh_min, sh_max);
        }
    }

    let sh_packed = pack_half2(sh_min, sh_max);
    ChunkInfo {
        col_r: pack_half2(col_min[0], col_max[0]),
        col_g: pack_half2(col_min[1], col_max[1]),
        col_b: pack_half2(col_min[2], col_max[2]),
        col_a: pack_half2(col_min[3], col_max[3]),
        pos_x: [pos_min[0], pos_max[0]],
        pos_y: [pos_min[1], pos_max[1]],
        pos_z: [pos_min[2], pos_max[2]],
        scl_x: pack_half2(scl_min[0], scl_max[0]),
        scl_y: pack_half2(scl_min[1], scl_max[1]),
        scl_z: pack_half2(scl_min[2], scl_max[2]),
        sh_r: sh_packed,
        sh_g: sh_packed,
        sh_b: sh_packed,
    }
}

/// Partitions the (already Morton-ordered) splats into 256-splat chunks,
/// rewrites every attribute value in place to its normalized [0,1] form and
/// emits one bounds record per chunk. Chunks are disjoint slices, so they
/// normalize in parallel.
pub fn normalize_chunks(splats: &mut [InputSplat]) -> Vec<ChunkInfo> {
    splats
        .par_chunks_mut(CHUNK_SPLAT_COUNT)
        .map(normalize_chunk)
        .collect()
}
