//! VRAM estimation for models with no registry entry.
//!
//! Weight bytes come from the Hub's `safetensors.parameters` dtype map. The
//! 1.35 multiplier covers activations, CUDA context and allocator
//! fragmentation; the result snaps upward to the provisioning tiers we
//! actually rent.

use std::collections::HashMap;

use crate::error::VisgateError;

/// GB tiers a deployment can be sized at, smallest to largest.
pub const VRAM_TIERS_GB: &[u32] = &[6, 8, 10, 12, 16, 24, 28, 40, 48, 80];

/// Headroom multiplier over raw weight bytes.
const HEADROOM: f64 = 1.35;

/// Bytes per parameter for a safetensors dtype string.
///
/// Accepts both the Hub's short spellings (`I8`, `U8`) and the long ones
/// (`INT8`, `UINT8`). Unknown dtypes count 4 bytes, erring on the large side.
pub fn bytes_per_dtype(dtype: &str) -> u64 {
    match dtype {
        "BF16" | "F16" => 2,
        "F32" => 4,
        "F64" => 8,
        "F8_E4M3" | "F8_E5M2" => 1,
        "I8" | "INT8" | "U8" | "UINT8" | "BOOL" => 1,
        "I16" | "INT16" => 2,
        "I32" | "INT32" => 4,
        "I64" | "INT64" => 8,
        _ => 4,
    }
}

/// Total weight bytes for a dtype -> parameter-count map.
pub fn weight_bytes(parameters: &HashMap<String, u64>) -> u64 {
    parameters
        .iter()
        .map(|(dtype, count)| count * bytes_per_dtype(dtype))
        .sum()
}

/// Minimum GPU memory for the given raw weight bytes: apply headroom,
/// round up to whole GB, snap to the next tier. Above the top tier the
/// estimate clamps to 80 GB.
pub fn min_vram_gb_for_bytes(bytes: u64) -> u32 {
    let gb = (bytes as f64 * HEADROOM / (1u64 << 30) as f64).ceil() as u32;
    snap_to_tier(gb)
}

/// Estimate from a dtype map, or `UnsupportedModel` when the map is empty.
pub fn estimate_min_vram_gb(
    model_id: &str,
    parameters: Option<&HashMap<String, u64>>,
) -> Result<u32, VisgateError> {
    let bytes = parameters.map(weight_bytes).unwrap_or(0);
    if bytes == 0 {
        return Err(VisgateError::UnsupportedModel {
            model_id: model_id.to_string(),
        });
    }
    Ok(min_vram_gb_for_bytes(bytes))
}

fn snap_to_tier(gb: u32) -> u32 {
    for &tier in VRAM_TIERS_GB {
        if gb <= tier {
            return tier;
        }
    }
    *VRAM_TIERS_GB.last().unwrap()
}
