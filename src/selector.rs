//! Cost-ordered GPU selection.
//!
//! Produces the ordered candidate list the engine consumes during capacity
//! fallback. A requested tier is honored when it fits and rejected outright
//! when it does not; the selector never silently upgrades a user choice.

use crate::error::VisgateError;
use crate::gpu::{resolve_tier, GpuSpec, GPU_REGISTRY};

/// Ordered candidates for a deployment, cheapest first.
///
/// Rules:
/// 1. Only tiers with `vram_gb >= min_vram_gb` are considered.
/// 2. A sufficient `requested_tier` becomes the first candidate; the rest
///    follow in `(cost_index, vram_gb, tier_id)` order.
/// 3. An insufficient `requested_tier` is `UnsupportedGpu`.
/// 4. An empty candidate list is `InsufficientGpu`.
pub fn select_candidates(
    min_vram_gb: u32,
    requested_tier: Option<&str>,
) -> Result<Vec<&'static GpuSpec>, VisgateError> {
    let mut sufficient: Vec<&'static GpuSpec> = GPU_REGISTRY
        .iter()
        .filter(|spec| spec.vram_gb >= min_vram_gb)
        .collect();
    sufficient.sort_by_key(|spec| (spec.cost_index, spec.vram_gb, spec.tier_id));

    let preferred = match requested_tier.map(str::trim).filter(|s| !s.is_empty()) {
        Some(name) => match resolve_tier(name) {
            Some(spec) if spec.vram_gb >= min_vram_gb => Some(spec),
            Some(_) => {
                return Err(VisgateError::UnsupportedGpu {
                    requested: name.to_string(),
                    required_vram_gb: min_vram_gb,
                })
            }
            // Unknown alias: fall through to pure cost ordering rather than
            // failing the deployment over a typo'd hint.
            None => None,
        },
        None => None,
    };

    if sufficient.is_empty() {
        return Err(VisgateError::InsufficientGpu {
            required_vram_gb: min_vram_gb,
        });
    }

    if let Some(first) = preferred {
        let mut ordered = Vec::with_capacity(sufficient.len());
        ordered.push(first);
        ordered.extend(sufficient.into_iter().filter(|s| s.tier_id != first.tier_id));
        return Ok(ordered);
    }

    Ok(sufficient)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(candidates: &[&GpuSpec]) -> Vec<&'static str> {
        candidates.iter().map(|s| s.tier_id).collect()
    }

    #[test]
    fn cheapest_first_for_small_model() {
        let candidates = select_candidates(8, None).unwrap();
        assert_eq!(ids(&candidates)[0], "AMPERE_16");
        // Every candidate fits; ordering is (cost, vram, id).
        for spec in &candidates {
            assert!(spec.vram_gb >= 8);
        }
        let costs: Vec<u32> = candidates.iter().map(|s| s.cost_index).collect();
        let mut sorted = costs.clone();
        sorted.sort();
        assert_eq!(costs, sorted);
    }

    #[test]
    fn flux_dev_candidates_match_cost_order() {
        // 28 GB floor: 24 GB tiers drop out, leaving the 48/80 GB tiers.
        let candidates = select_candidates(28, None).unwrap();
        assert_eq!(
            ids(&candidates),
            vec!["AMPERE_48", "ADA_48_PRO", "AMPERE_80", "ADA_80_PRO"]
        );
    }

    #[test]
    fn requested_tier_leads_when_sufficient() {
        let candidates = select_candidates(8, Some("A40")).unwrap();
        assert_eq!(ids(&candidates)[0], "AMPERE_48");
        // The rest are still cost-ordered and do not repeat the pick.
        assert!(!ids(&candidates)[1..].contains(&"AMPERE_48"));
    }

    #[test]
    fn requested_tier_too_small_is_rejected() {
        let err = select_candidates(28, Some("A10")).unwrap_err();
        assert!(matches!(err, VisgateError::UnsupportedGpu { .. }));
    }

    #[test]
    fn unknown_hint_falls_back_to_cost_order() {
        let candidates = select_candidates(8, Some("B200")).unwrap();
        assert_eq!(ids(&candidates)[0], "AMPERE_16");
    }

    #[test]
    fn nothing_fits_is_insufficient() {
        let err = select_candidates(96, None).unwrap_err();
        assert!(matches!(
            err,
            VisgateError::InsufficientGpu {
                required_vram_gb: 96
            }
        ));
    }

    #[test]
    fn every_candidate_fits_property() {
        for vram in [1u32, 6, 12, 17, 24, 25, 48, 49, 80] {
            if let Ok(candidates) = select_candidates(vram, None) {
                for spec in candidates {
                    assert!(spec.vram_gb >= vram, "{} < {vram}", spec.tier_id);
                }
            }
        }
    }
}
