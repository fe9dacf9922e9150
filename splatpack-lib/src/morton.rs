use rayon::prelude::*;

use crate::structures::InputSplat;

/// Bits of precision per axis for the 3D Morton code; 3 * 21 = 63 bits.
const MORTON_BITS: u32 = 21;
const MORTON_MAX: f32 = ((1u32 << MORTON_BITS) - 1) as f32;

/// Spreads the low 21 bits of `x`, inserting two zero bits between each.
#[inline]
fn part_1by2(mut x: u64) -> u64 {
    x &= 0x1f_ffff;
    x = (x | (x << 32)) & 0x1f_0000_0000_ffff;
    x = (x | (x << 16)) & 0x1f_0000_ff00_00ff;
    x = (x | (x << 8)) & 0x100f_00f0_0f00_f00f;
    x = (x | (x << 4)) & 0x10c3_0c30_c30c_30c3;
    x = (x | (x << 2)) & 0x1249_2492_4924_9249;
    x
}

#[inline]
pub fn morton3d(x: u32, y: u32, z: u32) -> u64 {
    part_1by2(x as u64) | (part_1by2(y as u64) << 1) | (part_1by2(z as u64) << 2)
}

/// Axis-aligned bounding box over all splat positions.
pub fn compute_bounds(splats: &[InputSplat]) -> ([f32; 3], [f32; 3]) {
    splats
        .par_iter()
        .with_min_len(4096)
        .fold(
            || ([f32::MAX; 3], [f32::MIN; 3]),
            |(mut bmin, mut bmax), s| {
                for a in 0..3 {
                    bmin[a] = bmin[a].min(s.pos[a]);
                    bmax[a] = bmax[a].max(s.pos[a]);
                }
                (bmin, bmax)
            },
        )
        .reduce(
            || ([f32::MAX; 3], [f32::MIN; 3]),
            |(amin, amax), (bmin, bmax)| {
                (
                    [
                        amin[0].min(bmin[0]),
                        amin[1].min(bmin[1]),
                        amin[2].min(bmin[2]),
                    ],
                    [
                        amax[0].max(bmax[0]),
                        amax[1].max(bmax[1]),
                        amax[2].max(bmax[2]),
                    ],
                )
            },
        )
}

#[inline]
fn morton_code_for(pos: [f32; 3], bmin: [f32; 3], inv_extent: [f32; 3]) -> u64 {
    let mut q = [0u32; 3];
    for a in 0..3 {
        let t = (pos[a] - bmin[a]) * inv_extent[a];
        q[a] = (t.clamp(0.0, 1.0) * MORTON_MAX) as u32;
    }
    morton3d(q[0], q[1], q[2])
}

/// Physically rewrites the splat array in ascending 3D Morton order of the
/// positions quantized to 21 bits per axis inside the bounding box. Ties
/// keep their original relative order. Degenerate axes (zero extent)
/// collapse to coordinate zero instead of dividing by zero.
pub fn reorder_morton(splats: &mut Vec<InputSplat>) {
    if splats.is_empty() {
        return;
    }
    let (bmin, bmax) = compute_bounds(splats);
    let mut inv_extent = [0.0f32; 3];
    for a in 0..3 {
        let extent = bmax[a] - bmin[a];
        inv_extent[a] = if extent > 0.0 { 1.0 / extent } else { 0.0 };
    }

    let mut order: Vec<(u64, u32)> = splats
        .par_iter()
        .with_min_len(4096)
        .enumerate()
        .map(|(i, s)| (morton_code_for(s.pos, bmin, inv_extent), i as u32))
        .collect();
    // The (code, index) pair is a total order, so the unstable parallel sort
    // still preserves original order among equal codes.
    order.par_sort_unstable();

    let reordered: Vec<InputSplat> = order
        .par_iter()
        .with_min_len(4096)
        .map(|&(_, i)| splats[i as usize])
        .collect();
    *splats = reordered;
}

/// 2D Morton decode of an 8-bit code into a 16x16 tile position.
#[inline]
fn compact_1by1_u8(v: u32) -> u32 {
    let mut x = v & 0x55;
    x = (x | (x >> 1)) & 0x33;
    x = (x | (x >> 2)) & 0x0f;
    x
}

#[inline]
pub fn decode_morton2d_16x16(code: u32) -> (u32, u32) {
    (compact_1by1_u8(code), compact_1by1_u8(code >> 1))
}

#[inline]
pub fn encode_morton2d_16x16(x: u32, y: u32) -> u32 {
    let mut code = 0u32;
    for b in 0..4 {
        code |= ((x >> b) & 1) << (2 * b);
        code |= ((y >> b) & 1) << (2 * b + 1);
    }
    code
}

/// Maps a splat index to its texel in the fixed-width color texture: the
/// low 8 bits pick a position inside a 16x16 tile via inverse 2D Morton
/// decode, the remaining bits pick the tile in row-major order.
#[inline]
pub fn splat_index_to_texel(index: usize, tex_width: usize) -> (usize, usize) {
    let (tx, ty) = decode_morton2d_16x16((index & 0xFF) as u32);
    let tile = index >> 8;
    let tiles_per_row = tex_width / 16;
    let tile_x = tile % tiles_per_row;
    let tile_y = tile / tiles_per_row;
    (tile_x * 16 + tx as usize, tile_y * 16 + ty as usize)
}

/// Inverse of `splat_index_to_texel`.
#[inline]
pub fn texel_to_splat_index(x: usize, y: usize, tex_width: usize) -> usize {
    let tiles_per_row = tex_width / 16;
    let tile = (y / 16) * tiles_per_row + x / 16;
    let inner = encode_morton2d_16x16((x % 16) as u32, (y % 16) as u32) as usize;
    (tile << 8) | inner
}
