pub mod chunk;
pub mod common;
pub mod encode;
pub mod error;
pub mod kmeans;
pub mod morton;
pub mod ply;
pub mod structures;

use std::hash::{BuildHasher, Hasher};

use foldhash::quality::FixedState;
use zerocopy::IntoBytes;

use chunk::normalize_chunks;
use encode::{create_color_data, create_other_data, create_pos_data, create_sh_data};
use kmeans::cluster;
use morton::reorder_morton;

pub use error::SplatError;
pub use ply::{peek_vertex_count, read_ply};
pub use structures::{
    ColorBlockCodec, ColorFormat, InputSplat, PackParams, QualityPreset, ShFormat, SplatAsset,
    VectorFormat, FORMAT_VERSION, SH_FLOAT_COUNT,
};

/// Order- and format-sensitive 128-bit digest: two independently seeded
/// 64-bit streams over the same bytes.
struct ContentHash {
    lo: foldhash::quality::FoldHasher,
    hi: foldhash::quality::FoldHasher,
}

impl ContentHash {
    fn new() -> Self {
        Self {
            lo: FixedState::with_seed(0x5370_6c61_7450_6163).build_hasher(),
            hi: FixedState::with_seed(0x6b41_7373_6574_4861).build_hasher(),
        }
    }

    fn fold_u64(&mut self, v: u64) {
        self.lo.write_u64(v);
        self.hi.write_u64(v);
    }

    fn fold_bytes(&mut self, bytes: &[u8]) {
        self.lo.write(bytes);
        self.hi.write(bytes);
    }

    fn finish(self) -> u128 {
        ((self.lo.finish() as u128) << 64) | self.hi.finish() as u128
    }
}

fn hash_asset(asset: &SplatAsset) -> u128 {
    let mut h = ContentHash::new();
    h.fold_u64(FORMAT_VERSION as u64);
    h.fold_u64(asset.splat_count as u64);
    h.fold_u64(asset.pos_format as u64);
    h.fold_u64(asset.scale_format as u64);
    h.fold_u64(asset.color_format as u64);
    h.fold_u64(asset.sh_format as u64);
    h.fold_bytes(&asset.chunk_data);
    h.fold_bytes(&asset.pos_data);
    h.fold_bytes(&asset.other_data);
    h.fold_bytes(&asset.color_data);
    h.fold_bytes(&asset.sh_data);
    h.finish()
}

/// Runs SH clustering when the requested format asks for it. Returns the
/// final SH format together with the raw-coefficient codebook and per-splat
/// labels, or falls back to plain float16 records when the codebook would
/// not be smaller than the data or the caller cancelled.
fn cluster_sh(
    splats: &[InputSplat],
    params: &PackParams,
    progress: &mut dyn FnMut(f32) -> bool,
) -> Result<(ShFormat, Option<(Vec<f32>, Vec<u32>)>), SplatError> {
    let k = match params.sh_format.cluster_count() {
        Some(k) => k,
        None => return Ok((params.sh_format, None)),
    };
    let n = splats.len();
    if k >= n {
        return Ok((ShFormat::Float16, None));
    }

    let mut data = Vec::with_capacity(n * SH_FLOAT_COUNT);
    for s in splats {
        data.extend_from_slice(&s.sh);
    }
    let mut means = vec![0.0f32; k * SH_FLOAT_COUNT];
    let mut labels = vec![0u32; n];
    let passes = params
        .cluster_passes
        .unwrap_or_else(|| params.sh_format.default_cluster_passes());
    let finished = cluster(
        SH_FLOAT_COUNT,
        &data,
        params.cluster_batch_size,
        passes,
        params.seed,
        &mut means,
        &mut labels,
        progress,
    )?;
    if !finished {
        return Ok((ShFormat::Float16, None));
    }
    Ok((params.sh_format, Some((means, labels))))
}

/// Packs a splat cloud into the final asset.
///
/// The input is reordered along a 3D Morton curve, optionally SH-clustered,
/// normalized into 256-splat chunks when any format is lossy, and encoded
/// into five independent byte buffers. `codec` is only consulted for the
/// BC7 color format. `progress` receives fractions in [0, 1] during the
/// clustering phase; returning `false` degrades the SH format to float16
/// instead of aborting the pack.
#[inline(never)]
pub fn pack_splats(
    mut splats: Vec<InputSplat>,
    params: &PackParams,
    codec: Option<&dyn ColorBlockCodec>,
    progress: Option<&mut dyn FnMut(f32) -> bool>,
) -> Result<SplatAsset, SplatError> {
    if splats.is_empty() {
        return Err(SplatError::EmptyCloud);
    }
    let mut default_progress = |_: f32| true;
    let progress: &mut dyn FnMut(f32) -> bool = match progress {
        Some(p) => p,
        None => &mut default_progress,
    };

    reorder_morton(&mut splats);

    // Clustering sees the raw coefficients; the codebook must not depend on
    // per-chunk bounds.
    let (sh_format, clustered) = cluster_sh(&splats, params, progress)?;

    let chunk_data = if params.is_lossless() {
        Vec::new()
    } else {
        let chunks = normalize_chunks(&mut splats);
        chunks.as_bytes().to_vec()
    };

    let pos_data = create_pos_data(&splats, params.pos_format);
    let (means, labels) = match &clustered {
        Some((m, l)) => (Some(m.as_slice()), Some(l.as_slice())),
        None => (None, None),
    };
    let other_data = create_other_data(&splats, params.scale_format, labels);
    let (color_data, color_width, color_height) =
        create_color_data(&splats, params.color_format, codec)?;
    let sh_data = create_sh_data(&splats, sh_format, means);

    let mut asset = SplatAsset {
        splat_count: splats.len(),
        pos_format: params.pos_format,
        scale_format: params.scale_format,
        color_format: params.color_format,
        sh_format,
        chunk_data,
        pos_data,
        other_data,
        color_data,
        color_width,
        color_height,
        sh_data,
        data_hash: 0,
    };
    asset.data_hash = hash_asset(&asset);
    Ok(asset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{
        calc_color_data_size, calc_other_data_size, calc_pos_data_size, calc_sh_data_size,
    };
    use crate::structures::{ChunkInfo, CHUNK_SPLAT_COUNT};

    fn synthetic_cloud(n: usize) -> Vec<InputSplat> {
        let mut state = 4242u32;
        let mut next = move || {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            (state >> 8) as f32 / (1 << 24) as f32
        };
        (0..n)
            .map(|_| {
                let mut s = InputSplat {
                    pos: [next() * 50.0 - 25.0, next() * 10.0, next() * 50.0 - 25.0],
                    rot: [next() - 0.5, next() - 0.5, next() - 0.5, next() + 0.5],
                    scale: [next() * 0.5 + 0.001, next() * 0.5 + 0.001, next() * 0.5 + 0.001],
                    opacity: next(),
                    dc: [next(), next(), next()],
                    ..Default::default()
                };
                for v in s.sh.iter_mut() {
                    *v = next() - 0.5;
                }
                s
            })
            .collect()
    }

    struct NullCodec;
    impl ColorBlockCodec for NullCodec {
        fn encode(&self, width: usize, height: usize, _rgba: &[f32]) -> Vec<u8> {
            vec![0u8; width * height]
        }
    }

    #[test]
    fn test_empty_cloud_is_an_error() {
        let err = pack_splats(Vec::new(), &PackParams::default(), None, None).unwrap_err();
        assert!(matches!(err, SplatError::EmptyCloud));
    }

    #[test]
    fn test_single_splat_asset_shape() {
        let asset = pack_splats(synthetic_cloud(1), &PackParams::default(), None, None).unwrap();
        assert_eq!(asset.splat_count, 1);
        assert_eq!(asset.chunk_data.len(), ChunkInfo::SIZE);
        assert_eq!((asset.color_width, asset.color_height), (2048, 16));
        assert!(!asset.is_sh_clustered());
        assert_ne!(asset.data_hash, 0);
    }

    #[test]
    fn test_buffer_sizes_match_calculators() {
        let n = 700;
        let params = PackParams::from_preset(QualityPreset::High);
        let asset = pack_splats(synthetic_cloud(n), &params, None, None).unwrap();
        assert_eq!(
            asset.chunk_data.len(),
            n.div_ceil(CHUNK_SPLAT_COUNT) * ChunkInfo::SIZE
        );
        assert_eq!(asset.pos_data.len(), calc_pos_data_size(n, params.pos_format));
        assert_eq!(
            asset.other_data.len(),
            calc_other_data_size(n, params.scale_format, false)
        );
        assert_eq!(
            asset.color_data.len(),
            calc_color_data_size(n, params.color_format)
        );
        assert_eq!(asset.sh_data.len(), calc_sh_data_size(n, params.sh_format));
    }

    #[test]
    fn test_lossless_preset_skips_chunk_data() {
        let params = PackParams::from_preset(QualityPreset::VeryHigh);
        let asset = pack_splats(synthetic_cloud(300), &params, None, None).unwrap();
        assert!(asset.chunk_data.is_empty());
        assert_eq!(asset.sh_format, ShFormat::Float32);
    }

    #[test]
    fn test_medium_preset_beats_raw_size() {
        let n = 1000;
        let raw = n * std::mem::size_of::<InputSplat>();
        let asset = pack_splats(synthetic_cloud(n), &PackParams::default(), None, None).unwrap();
        assert!(
            asset.total_size() < raw,
            "packed {} vs raw {}",
            asset.total_size(),
            raw
        );
    }

    #[test]
    fn test_clustering_falls_back_below_codebook_size() {
        // 100 splats cannot feed a 4096-entry codebook.
        let params = PackParams::from_preset(QualityPreset::VeryLow);
        let asset = pack_splats(synthetic_cloud(100), &params, None, None).unwrap();
        assert_eq!(asset.sh_format, ShFormat::Float16);
        assert!(!asset.is_sh_clustered());
        // No cluster index in the other buffer either.
        assert_eq!(
            asset.other_data.len(),
            calc_other_data_size(100, params.scale_format, false)
        );
    }

    #[test]
    fn test_clustered_sh_emits_codebook_and_labels() {
        // Cloud comfortably larger than the smallest codebook.
        let n = 5000;
        let params = PackParams::from_preset(QualityPreset::VeryLow);
        let asset = pack_splats(synthetic_cloud(n), &params, None, None).unwrap();
        assert!(asset.is_sh_clustered());
        assert_eq!(asset.sh_data.len(), 4096 * ShFormat::CLUSTER_STRIDE);
        assert_eq!(
            asset.other_data.len(),
            calc_other_data_size(n, params.scale_format, true)
        );
    }

    #[test]
    fn test_cancellation_degrades_to_float16() {
        let params = PackParams::from_preset(QualityPreset::VeryLow);
        let mut cancel = |_: f32| false;
        let asset =
            pack_splats(synthetic_cloud(5000), &params, None, Some(&mut cancel)).unwrap();
        assert_eq!(asset.sh_format, ShFormat::Float16);
    }

    #[test]
    fn test_hash_is_sensitive_to_data_and_format() {
        let cloud = synthetic_cloud(500);
        let params = PackParams::default();
        let a = pack_splats(cloud.clone(), &params, None, None).unwrap();

        let b = pack_splats(cloud.clone(), &params, None, None).unwrap();
        assert_eq!(a.data_hash, b.data_hash);

        let mut moved = cloud.clone();
        moved[123].pos[0] += 0.25;
        let c = pack_splats(moved, &params, None, None).unwrap();
        assert_ne!(a.data_hash, c.data_hash);

        let mut other = params.clone();
        other.pos_format = VectorFormat::Norm16;
        let d = pack_splats(cloud, &other, None, None).unwrap();
        assert_ne!(a.data_hash, d.data_hash);
    }

    #[test]
    fn test_bc7_path_uses_the_codec() {
        let mut params = PackParams::default();
        params.color_format = ColorFormat::Bc7;

        assert!(pack_splats(synthetic_cloud(10), &params, None, None).is_err());

        let asset =
            pack_splats(synthetic_cloud(10), &params, Some(&NullCodec), None).unwrap();
        assert_eq!(asset.color_data.len(), 2048 * 16);
    }

    /// Full-scale compression check; slow, run explicitly.
    #[test]
    #[ignore]
    fn test_very_low_preset_compresses_ten_to_one() {
        let n = 100_000;
        let raw = n * std::mem::size_of::<InputSplat>();
        let params = PackParams::from_preset(QualityPreset::VeryLow);
        let asset = pack_splats(synthetic_cloud(n), &params, None, None).unwrap();
        assert!(asset.is_sh_clustered());
        assert!(
            asset.total_size() * 10 <= raw,
            "packed {} vs raw {}",
            asset.total_size(),
            raw
        );
    }
}
