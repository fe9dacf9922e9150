use half::f16;

/// SH band-0 basis constant, used to turn the raw DC term into base color.
pub const SH_C0: f32 = 0.282_094_8;

#[inline]
pub fn saturate(x: f32) -> f32 {
    x.clamp(0.0, 1.0)
}

#[inline]
pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Packs a (min, max) bound pair as two IEEE binary16 values in one word,
/// `lo | hi << 16`. Round-to-nearest-even, bit-portable across platforms.
#[inline]
pub fn pack_half2(min: f32, max: f32) -> u32 {
    let lo = f16::from_f32(min).to_bits() as u32;
    let hi = f16::from_f32(max).to_bits() as u32;
    lo | (hi << 16)
}

#[inline]
pub fn unpack_half2(packed: u32) -> (f32, f32) {
    let lo = f16::from_bits((packed & 0xFFFF) as u16).to_f32();
    let hi = f16::from_bits((packed >> 16) as u16).to_f32();
    (lo, hi)
}

/// Dynamic-range compression applied to linear scale values before bounds
/// are measured: small scales get a larger share of the quantization budget.
/// The exponent is empirically tuned; keep it.
#[inline]
pub fn transform_scale(v: f32) -> f32 {
    v.powf(0.125)
}

#[inline]
pub fn inverse_transform_scale(v: f32) -> f32 {
    let v2 = v * v;
    let v4 = v2 * v2;
    v4 * v4
}

/// Square-centered-at-0.5 remap for opacity. Strictly monotonic on [0,1];
/// spends more precision near fully transparent and fully opaque.
#[inline]
pub fn transform_opacity(x: f32) -> f32 {
    let d = x - 0.5;
    d.signum() * d * d * 2.0 + 0.5
}

#[inline]
pub fn inverse_transform_opacity(y: f32) -> f32 {
    let d = y - 0.5;
    d.signum() * (d.abs() * 0.5).sqrt() + 0.5
}
