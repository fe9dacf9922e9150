//! Binary PLY reader for Gaussian splat point clouds.
//!
//! Reads the de-facto training output layout (float32 properties, raw
//! log-space scales and logit opacities) and produces [`InputSplat`]s with
//! all activations applied, ready for packing.

use foldhash::HashMap;
use foldhash::HashMapExt;

use crate::common::{sigmoid, SH_C0};
use crate::error::SplatError;
use crate::structures::{InputSplat, SH_COEFF_COUNT};

#[inline]
fn next_line<'b>(buffer: &'b [u8], offset: &mut usize) -> Option<&'b [u8]> {
    if *offset >= buffer.len() {
        return None;
    }
    let start = *offset;

    match memchr::memchr(b'\n', &buffer[*offset..]) {
        Some(pos) => {
            *offset = start + pos + 1;
            Some(&buffer[start..start + pos])
        }
        None => {
            *offset = buffer.len();
            Some(&buffer[start..])
        }
    }
}

#[inline(always)]
fn idx_of(hm: &HashMap<&str, usize>, name: &str) -> Result<usize, SplatError> {
    hm.get(name)
        .cloned()
        .ok_or_else(|| SplatError::ParseSplat(format!("Missing required field: {}", name)))
}

#[inline(always)]
fn bytes_to_f32(data: &[u8], field_name: &str) -> Result<f32, SplatError> {
    Ok(f32::from_le_bytes(data.try_into().map_err(|e| {
        SplatError::ParseSplat(format!("Byte conversion error for {}: {}", field_name, e))
    })?))
}

/// Parses the header far enough to learn the vertex count without touching
/// the binary payload.
pub fn peek_vertex_count(raw_data: &[u8]) -> Result<usize, SplatError> {
    let mut offset = 0;
    parse_header_preamble(raw_data, &mut offset)
}

fn parse_header_preamble(raw_data: &[u8], offset: &mut usize) -> Result<usize, SplatError> {
    // Line #1: "ply"
    let line1 = next_line(raw_data, offset)
        .ok_or_else(|| SplatError::ParseSplat("No 'ply' line".to_string()))?;
    if line1 != b"ply" {
        return Err(SplatError::ParseSplat(
            "Not a .ply file (missing 'ply' header)".to_string(),
        ));
    }

    // Line #2: "format binary_little_endian 1.0"
    let line2 = next_line(raw_data, offset)
        .ok_or_else(|| SplatError::ParseSplat("Missing format line".to_string()))?;
    if line2 != b"format binary_little_endian 1.0" {
        return Err(SplatError::ParseSplat(
            "Unsupported .ply format (only binary_little_endian 1.0 is supported)".to_string(),
        ));
    }

    // Line #3: "element vertex N"
    let line3 = next_line(raw_data, offset)
        .ok_or_else(|| SplatError::ParseSplat("Missing 'element vertex' line".to_string()))?;
    if !line3.starts_with(b"element vertex ") {
        return Err(SplatError::ParseSplat(
            "Missing 'element vertex' definition".to_string(),
        ));
    }
    let num_str = &line3[b"element vertex ".len()..];
    let num_points: usize = {
        let s = std::str::from_utf8(num_str)
            .map_err(|e| SplatError::ParseSplat(format!("UTF-8 error: {}", e)))?
            .trim();
        s.parse()
            .map_err(|e| SplatError::ParseSplat(format!("Parse error: {}", e)))?
    };
    Ok(num_points)
}

/// Reads a binary PLY splat cloud and applies the standard activations:
/// `exp` on log-space scales, sigmoid on logit opacities, the band-0 SH
/// basis on the DC color, and `wxyz -> xyzw` rotation reordering. Higher
/// SH bands below degree 3 are zero-filled.
pub fn read_ply(raw_data: &[u8]) -> Result<Vec<InputSplat>, SplatError> {
    let mut offset = 0;
    let num_points = parse_header_preamble(raw_data, &mut offset)?;
    if num_points == 0 {
        return Ok(Vec::new());
    }

    let mut field_names = Vec::new();
    loop {
        let line = match next_line(raw_data, &mut offset) {
            Some(l) => l,
            None => {
                return Err(SplatError::ParseSplat(
                    "No 'end_header' found before EOF".to_string(),
                ))
            }
        };

        if line.starts_with(b"end_header") {
            break;
        }

        // Only support "property float <name>"
        if !line.starts_with(b"property float ") {
            return Err(SplatError::ParseSplat(format!(
                "Unsupported property line: {:?}",
                line
            )));
        }

        field_names.push(&line[b"property float ".len()..]);
    }

    let mut field_map: HashMap<&str, usize> = HashMap::with_capacity(field_names.len());
    for (i, &f_bytes) in field_names.iter().enumerate() {
        let s = std::str::from_utf8(f_bytes)
            .map_err(|e| SplatError::ParseSplat(format!("UTF-8 error in field name: {}", e)))?;
        field_map.insert(s, i);
    }

    let ix = idx_of(&field_map, "x")?;
    let iy = idx_of(&field_map, "y")?;
    let iz = idx_of(&field_map, "z")?;
    let is0 = idx_of(&field_map, "scale_0")?;
    let is1 = idx_of(&field_map, "scale_1")?;
    let is2 = idx_of(&field_map, "scale_2")?;
    let ir0 = idx_of(&field_map, "rot_0")?;
    let ir1 = idx_of(&field_map, "rot_1")?;
    let ir2 = idx_of(&field_map, "rot_2")?;
    let ir3 = idx_of(&field_map, "rot_3")?;
    let iop = idx_of(&field_map, "opacity")?;
    let ic0 = idx_of(&field_map, "f_dc_0")?;
    let ic1 = idx_of(&field_map, "f_dc_1")?;
    let ic2 = idx_of(&field_map, "f_dc_2")?;

    // Optional spherical harmonics: f_rest_0 to f_rest_44.
    let mut sh_idx = Vec::new();
    for i in 0..SH_COEFF_COUNT * 3 {
        let nm = format!("f_rest_{}", i);
        if let Some(&found) = field_map.get(nm.as_str()) {
            sh_idx.push(found);
        } else {
            break;
        }
    }
    if sh_idx.len() % 3 != 0 {
        return Err(SplatError::ParseSplat(
            "Incomplete spherical harmonics fields".to_string(),
        ));
    }
    let sh_dim = sh_idx.len() / 3;
    if !matches!(sh_dim, 0 | 3 | 8 | 15) {
        return Err(SplatError::ParseSplat(format!(
            "Unsupported spherical harmonics dimension: {}",
            sh_dim
        )));
    }

    let fields_per_vertex = field_names.len();
    let expected_bytes = num_points
        .checked_mul(fields_per_vertex)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| SplatError::ParseSplat("Overflow in byte calculation".to_string()))?;
    if raw_data.len() < offset + expected_bytes {
        return Err(SplatError::ParseSplat(format!(
            "Binary data is too short, need {} bytes, have {}",
            expected_bytes,
            raw_data.len() - offset
        )));
    }

    let data = &raw_data[offset..offset + expected_bytes];

    // The PLY stores SH channel-major (all R coefficients, then G, then B);
    // regroup into per-coefficient RGB triplets.
    let sh_indices: Vec<_> = (0..sh_dim)
        .map(|j| (sh_idx[j], sh_idx[j + sh_dim], sh_idx[j + 2 * sh_dim]))
        .collect();

    let mut splats = Vec::with_capacity(num_points);
    let mut cursor = 0;
    for _ in 0..num_points {
        let vertex_data = &data[cursor..cursor + fields_per_vertex * 4];
        let mut s = InputSplat::default();

        s.pos[0] = bytes_to_f32(&vertex_data[ix * 4..(ix + 1) * 4], "x")?;
        s.pos[1] = bytes_to_f32(&vertex_data[iy * 4..(iy + 1) * 4], "y")?;
        s.pos[2] = bytes_to_f32(&vertex_data[iz * 4..(iz + 1) * 4], "z")?;

        for (a, &idx) in [is0, is1, is2].iter().enumerate() {
            let raw = bytes_to_f32(&vertex_data[idx * 4..(idx + 1) * 4], "scale")?;
            s.scale[a] = raw.exp();
        }

        // rot_0 is the scalar part; downstream expects a unit xyzw.
        let r0 = bytes_to_f32(&vertex_data[ir0 * 4..(ir0 + 1) * 4], "rot_0")?;
        let r1 = bytes_to_f32(&vertex_data[ir1 * 4..(ir1 + 1) * 4], "rot_1")?;
        let r2 = bytes_to_f32(&vertex_data[ir2 * 4..(ir2 + 1) * 4], "rot_2")?;
        let r3 = bytes_to_f32(&vertex_data[ir3 * 4..(ir3 + 1) * 4], "rot_3")?;
        let norm = (r0 * r0 + r1 * r1 + r2 * r2 + r3 * r3).sqrt();
        s.rot = if norm > 0.0 {
            [r1 / norm, r2 / norm, r3 / norm, r0 / norm]
        } else {
            [0.0, 0.0, 0.0, 1.0]
        };

        let opacity = bytes_to_f32(&vertex_data[iop * 4..(iop + 1) * 4], "opacity")?;
        s.opacity = sigmoid(opacity);

        for (a, &idx) in [ic0, ic1, ic2].iter().enumerate() {
            let raw = bytes_to_f32(&vertex_data[idx * 4..(idx + 1) * 4], "f_dc")?;
            s.dc[a] = raw * SH_C0 + 0.5;
        }

        for (j, &(r_idx, g_idx, b_idx)) in sh_indices.iter().enumerate() {
            s.sh[j * 3] = bytes_to_f32(&vertex_data[r_idx * 4..(r_idx + 1) * 4], "sh_r")?;
            s.sh[j * 3 + 1] = bytes_to_f32(&vertex_data[g_idx * 4..(g_idx + 1) * 4], "sh_g")?;
            s.sh[j * 3 + 2] = bytes_to_f32(&vertex_data[b_idx * 4..(b_idx + 1) * 4], "sh_b")?;
        }

        splats.push(s);
        cursor += fields_per_vertex * 4;
    }

    Ok(splats)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE_FIELDS: [&str; 14] = [
        "x", "y", "z", "scale_0", "scale_1", "scale_2", "rot_0", "rot_1", "rot_2", "rot_3",
        "opacity", "f_dc_0", "f_dc_1", "f_dc_2",
    ];

    fn build_ply(fields: &[&str], vertices: &[Vec<f32>]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"ply\nformat binary_little_endian 1.0\n");
        out.extend_from_slice(format!("element vertex {}\n", vertices.len()).as_bytes());
        for f in fields {
            out.extend_from_slice(format!("property float {}\n", f).as_bytes());
        }
        out.extend_from_slice(b"end_header\n");
        for v in vertices {
            assert_eq!(v.len(), fields.len());
            for x in v {
                out.extend_from_slice(&x.to_le_bytes());
            }
        }
        out
    }

    #[test]
    fn test_parse_empty_ply() {
        // No trailing newline after end_header.
        let data =
            b"ply\nformat binary_little_endian 1.0\nelement vertex 0\nproperty float x\nend_header";
        let splats = read_ply(data).unwrap();
        assert!(splats.is_empty());
        assert_eq!(peek_vertex_count(data).unwrap(), 0);
    }

    #[test]
    fn test_parse_one_vertex_applies_activations() {
        #[rustfmt::skip]
        let vertex = vec![
            1.0f32, 2.0, 3.0,           // x y z
            0.0, -1.0, 1.0,             // log scales
            1.0, 0.0, 0.0, 0.0,         // rot wxyz: identity
            0.0,                        // logit opacity
            0.5, -0.5, 0.0,             // f_dc
        ];
        let data = build_ply(&BASE_FIELDS, &[vertex]);
        let splats = read_ply(&data).unwrap();
        assert_eq!(splats.len(), 1);
        assert_eq!(peek_vertex_count(&data).unwrap(), 1);

        let s = &splats[0];
        assert_eq!(s.pos, [1.0, 2.0, 3.0]);
        assert!((s.scale[0] - 1.0).abs() < 1.0e-6);
        assert!((s.scale[1] - (-1.0f32).exp()).abs() < 1.0e-6);
        assert!((s.scale[2] - 1.0f32.exp()).abs() < 1.0e-6);
        assert_eq!(s.rot, [0.0, 0.0, 0.0, 1.0]); // reordered to xyzw
        assert!((s.opacity - 0.5).abs() < 1.0e-6); // sigmoid(0)
        assert!((s.dc[0] - (0.5 * SH_C0 + 0.5)).abs() < 1.0e-6);
        assert!((s.dc[1] - (-0.5 * SH_C0 + 0.5)).abs() < 1.0e-6);
        assert!(s.sh.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_parse_degree_one_sh_is_regrouped_and_zero_filled() {
        let mut fields: Vec<&str> = BASE_FIELDS.to_vec();
        let names: Vec<String> = (0..9).map(|i| format!("f_rest_{}", i)).collect();
        fields.extend(names.iter().map(|s| s.as_str()));

        let mut vertex = vec![0.0f32; 14];
        vertex[6] = 1.0; // rot_0 = w
        // Channel-major SH payload: R0..R2, G0..G2, B0..B2.
        vertex.extend((0..9).map(|i| i as f32 * 0.1));

        let splats = read_ply(&build_ply(&fields, &[vertex])).unwrap();
        let sh = &splats[0].sh;
        // First coefficient triplet is (R0, G0, B0).
        assert!((sh[0] - 0.0).abs() < 1.0e-6);
        assert!((sh[1] - 0.3).abs() < 1.0e-6);
        assert!((sh[2] - 0.6).abs() < 1.0e-6);
        assert!((sh[3] - 0.1).abs() < 1.0e-6);
        // Everything past coefficient 3 is zero-filled.
        assert!(sh[9..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_missing_field_is_an_error() {
        let fields: Vec<&str> = BASE_FIELDS
            .iter()
            .copied()
            .filter(|&f| f != "opacity")
            .collect();
        let vertex = vec![0.0f32; fields.len()];
        let err = read_ply(&build_ply(&fields, &[vertex])).unwrap_err();
        assert!(err.to_string().contains("opacity"), "{}", err);
    }

    #[test]
    fn test_truncated_binary_data_is_an_error() {
        let vertex = vec![0.0f32; 14];
        let mut data = build_ply(&BASE_FIELDS, &[vertex]);
        data.truncate(data.len() - 8);
        assert!(read_ply(&data).is_err());
    }

    #[test]
    fn test_unsupported_sh_dimension_is_an_error() {
        let mut fields: Vec<&str> = BASE_FIELDS.to_vec();
        // 6 SH fields -> dim 2, which no SH degree produces.
        let names: Vec<String> = (0..6).map(|i| format!("f_rest_{}", i)).collect();
        fields.extend(names.iter().map(|s| s.as_str()));
        let vertex = vec![0.0f32; fields.len()];
        assert!(read_ply(&build_ply(&fields, &[vertex])).is_err());
    }

    #[test]
    fn test_not_a_ply_is_an_error() {
        assert!(read_ply(b"obj\n").is_err());
        assert!(peek_vertex_count(b"ply\nformat ascii 1.0\n").is_err());
    }
}
