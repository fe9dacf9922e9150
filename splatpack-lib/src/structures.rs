use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const FORMAT_VERSION: u32 = 1;

/// Number of consecutive (Morton-ordered) splats sharing one set of
/// quantization bounds.
pub const CHUNK_SPLAT_COUNT: usize = 256;

/// Fixed width of the color texture; height grows with the splat count.
pub const COLOR_TEXTURE_WIDTH: usize = 2048;

/// Higher-order SH coefficient vectors per splat (3rd-order SH, 16 bands
/// including DC).
pub const SH_COEFF_COUNT: usize = 15;
pub const SH_FLOAT_COUNT: usize = SH_COEFF_COUNT * 3;

/// One raw splat as produced by a point-cloud reader. Scale is linear
/// (already exponentiated), opacity is in [0,1], `dc` is the decoded
/// band-0 color.
#[derive(Debug, Clone, Copy)]
pub struct InputSplat {
    pub pos: [f32; 3],
    pub rot: [f32; 4],
    pub scale: [f32; 3],
    pub opacity: f32,
    pub dc: [f32; 3],
    pub sh: [f32; SH_FLOAT_COUNT],
}

impl Default for InputSplat {
    fn default() -> Self {
        Self {
            pos: [0.0; 3],
            rot: [0.0, 0.0, 0.0, 1.0],
            scale: [0.0; 3],
            opacity: 0.0,
            dc: [0.0; 3],
            sh: [0.0; SH_FLOAT_COUNT],
        }
    }
}

/// Per-chunk quantization bounds. Color, scale and SH bounds are packed as
/// two binary16 values per word (`lo = min`, `hi = max`); positions keep
/// full float pairs. The three SH words all carry the same single min/max
/// shared across all 45 SH scalars of the chunk; the layout reserves one
/// word per channel.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ChunkInfo {
    pub col_r: u32,
    pub col_g: u32,
    pub col_b: u32,
    pub col_a: u32,
    pub pos_x: [f32; 2],
    pub pos_y: [f32; 2],
    pub pos_z: [f32; 2],
    pub scl_x: u32,
    pub scl_y: u32,
    pub scl_z: u32,
    pub sh_r: u32,
    pub sh_g: u32,
    pub sh_b: u32,
}

impl ChunkInfo {
    pub const SIZE: usize = 64;
}

/// Fixed-width quantization formats for 3-component vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorFormat {
    /// 3x float32, lossless.
    Float32,
    /// 16 bits per channel across 6 bytes.
    Norm16,
    /// 11.10.11 bits in one 32-bit word.
    Norm11,
    /// 6.5.5 bits in one 16-bit word.
    Norm6,
}

impl VectorFormat {
    pub const fn stride(self) -> usize {
        match self {
            VectorFormat::Float32 => 12,
            VectorFormat::Norm16 => 6,
            VectorFormat::Norm11 => 4,
            VectorFormat::Norm6 => 2,
        }
    }

    pub const fn is_lossless(self) -> bool {
        matches!(self, VectorFormat::Float32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorFormat {
    Float32x4,
    Float16x4,
    Norm8x4,
    /// GPU block-compressed, delegated to an external codec.
    Bc7,
}

impl ColorFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            ColorFormat::Float32x4 => 16,
            ColorFormat::Float16x4 => 8,
            ColorFormat::Norm8x4 => 4,
            ColorFormat::Bc7 => 1,
        }
    }

    pub const fn is_lossless(self) -> bool {
        matches!(self, ColorFormat::Float32x4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShFormat {
    Float32,
    Float16,
    Norm11,
    Norm6,
    Cluster64k,
    Cluster32k,
    Cluster16k,
    Cluster8k,
    Cluster4k,
}

impl ShFormat {
    /// Per-splat record stride for the non-clustered formats, including the
    /// trailing padding that keeps records at friendly power-of-two sizes.
    pub const fn splat_stride(self) -> usize {
        match self {
            ShFormat::Float32 => 192,
            ShFormat::Float16 => 96,
            ShFormat::Norm11 => 64,
            ShFormat::Norm6 => 32,
            // Clustered SH stores a 2-byte index in the Other buffer instead.
            _ => 0,
        }
    }

    /// Codebook record stride when clustered: 45 binary16 coefficients plus
    /// one padding half3.
    pub const CLUSTER_STRIDE: usize = 96;

    pub const fn cluster_count(self) -> Option<usize> {
        match self {
            ShFormat::Cluster64k => Some(64 * 1024),
            ShFormat::Cluster32k => Some(32 * 1024),
            ShFormat::Cluster16k => Some(16 * 1024),
            ShFormat::Cluster8k => Some(8 * 1024),
            ShFormat::Cluster4k => Some(4 * 1024),
            _ => None,
        }
    }

    pub const fn is_lossless(self) -> bool {
        matches!(self, ShFormat::Float32)
    }

    /// Empirically tuned passes over the data for mini-batch refinement;
    /// larger codebooks need fewer passes.
    pub fn default_cluster_passes(self) -> f32 {
        match self.cluster_count() {
            Some(k) if k >= 64 * 1024 => 0.3,
            Some(k) if k >= 32 * 1024 => 0.5,
            Some(k) if k >= 16 * 1024 => 0.7,
            Some(k) if k >= 8 * 1024 => 0.9,
            _ => 1.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityPreset {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

/// External block-texture compressor; RGBA32F texels in, compressed blocks
/// out. The pipeline treats it as a black box.
pub trait ColorBlockCodec {
    fn encode(&self, width: usize, height: usize, rgba: &[f32]) -> Vec<u8>;
}

#[derive(Debug, Clone)]
pub struct PackParams {
    pub pos_format: VectorFormat,
    pub scale_format: VectorFormat,
    pub color_format: ColorFormat,
    pub sh_format: ShFormat,
    /// Mini-batch size for SH clustering.
    pub cluster_batch_size: usize,
    /// Passes over the data for mini-batch refinement; `None` picks the
    /// tuned default for the codebook size.
    pub cluster_passes: Option<f32>,
    pub seed: u32,
}

impl PackParams {
    pub fn from_preset(preset: QualityPreset) -> Self {
        let (pos, scale, color, sh) = match preset {
            QualityPreset::VeryLow => (
                VectorFormat::Norm11,
                VectorFormat::Norm6,
                ColorFormat::Norm8x4,
                ShFormat::Cluster4k,
            ),
            QualityPreset::Low => (
                VectorFormat::Norm11,
                VectorFormat::Norm6,
                ColorFormat::Norm8x4,
                ShFormat::Cluster16k,
            ),
            QualityPreset::Medium => (
                VectorFormat::Norm11,
                VectorFormat::Norm11,
                ColorFormat::Norm8x4,
                ShFormat::Norm6,
            ),
            QualityPreset::High => (
                VectorFormat::Norm16,
                VectorFormat::Norm16,
                ColorFormat::Float16x4,
                ShFormat::Norm11,
            ),
            QualityPreset::VeryHigh => (
                VectorFormat::Float32,
                VectorFormat::Float32,
                ColorFormat::Float32x4,
                ShFormat::Float32,
            ),
        };
        Self {
            pos_format: pos,
            scale_format: scale,
            color_format: color,
            sh_format: sh,
            cluster_batch_size: 2048,
            cluster_passes: None,
            seed: 0x2A,
        }
    }

    /// True when every attribute group keeps full 32-bit fidelity; the
    /// chunked normalizer is skipped entirely on this path.
    pub fn is_lossless(&self) -> bool {
        self.pos_format.is_lossless()
            && self.scale_format.is_lossless()
            && self.color_format.is_lossless()
            && self.sh_format.is_lossless()
    }
}

impl Default for PackParams {
    fn default() -> Self {
        Self::from_preset(QualityPreset::Medium)
    }
}

/// The finished asset: five independent flat byte buffers plus metadata.
#[derive(Debug, Clone)]
pub struct SplatAsset {
    pub splat_count: usize,
    pub pos_format: VectorFormat,
    pub scale_format: VectorFormat,
    pub color_format: ColorFormat,
    /// Final SH format; may differ from the requested one when clustering
    /// was skipped (k >= N) or cancelled.
    pub sh_format: ShFormat,
    pub chunk_data: Vec<u8>,
    pub pos_data: Vec<u8>,
    pub other_data: Vec<u8>,
    pub color_data: Vec<u8>,
    pub color_width: usize,
    pub color_height: usize,
    pub sh_data: Vec<u8>,
    /// Order- and format-sensitive digest over everything emitted; used
    /// for cache invalidation, not integrity.
    pub data_hash: u128,
}

impl SplatAsset {
    pub fn total_size(&self) -> usize {
        self.chunk_data.len()
            + self.pos_data.len()
            + self.other_data.len()
            + self.color_data.len()
            + self.sh_data.len()
    }

    pub fn is_sh_clustered(&self) -> bool {
        self.sh_format.cluster_count().is_some()
    }
}
