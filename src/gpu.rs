//! GPU tier catalog.
//!
//! Tiers are provider-native ids with a qualitative `cost_index` (1 cheapest,
//! 10 most expensive). The catalog is loaded once and never mutated; the
//! selector consumes it in cost order.

/// Read-only description of one GPU tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuSpec {
    /// Provider-native tier id (what endpoint creation wants).
    pub tier_id: &'static str,
    pub display_name: &'static str,
    pub vram_gb: u32,
    pub cost_index: u32,
    pub family: &'static str,
    /// Accepted user-input aliases, matched case-insensitively.
    pub aliases: &'static [&'static str],
}

/// The catalog, cost_index ascending.
pub const GPU_REGISTRY: &[GpuSpec] = &[
    GpuSpec {
        tier_id: "AMPERE_16",
        display_name: "NVIDIA A16",
        vram_gb: 16,
        cost_index: 1,
        family: "ampere",
        aliases: &["A16"],
    },
    GpuSpec {
        tier_id: "AMPERE_24",
        display_name: "NVIDIA A10 / A30",
        vram_gb: 24,
        cost_index: 2,
        family: "ampere",
        aliases: &["A10", "A30"],
    },
    GpuSpec {
        tier_id: "ADA_24",
        display_name: "NVIDIA L40 / RTX 4090",
        vram_gb: 24,
        cost_index: 3,
        family: "ada",
        aliases: &["L40", "4090", "RTX4090"],
    },
    GpuSpec {
        tier_id: "AMPERE_48",
        display_name: "NVIDIA A40",
        vram_gb: 48,
        cost_index: 5,
        family: "ampere",
        aliases: &["A40"],
    },
    GpuSpec {
        tier_id: "ADA_48_PRO",
        display_name: "NVIDIA L40S",
        vram_gb: 48,
        cost_index: 6,
        family: "ada",
        aliases: &["L40S"],
    },
    GpuSpec {
        tier_id: "AMPERE_80",
        display_name: "NVIDIA A100",
        vram_gb: 80,
        cost_index: 8,
        family: "ampere",
        aliases: &["A100"],
    },
    GpuSpec {
        tier_id: "ADA_80_PRO",
        display_name: "NVIDIA H100",
        vram_gb: 80,
        cost_index: 10,
        family: "ada",
        aliases: &["H100"],
    },
];

/// Resolve a user-supplied tier name (alias or tier id, any case) to a spec.
pub fn resolve_tier(name: &str) -> Option<&'static GpuSpec> {
    let wanted = name.trim();
    if wanted.is_empty() {
        return None;
    }
    GPU_REGISTRY.iter().find(|spec| {
        spec.tier_id.eq_ignore_ascii_case(wanted)
            || spec
                .aliases
                .iter()
                .any(|alias| alias.eq_ignore_ascii_case(wanted))
    })
}

/// Look up a spec by its provider-native tier id.
pub fn tier_by_id(tier_id: &str) -> Option<&'static GpuSpec> {
    GPU_REGISTRY.iter().find(|spec| spec.tier_id == tier_id)
}

/// Human display name for a tier id, falling back to the id itself.
pub fn display_name(tier_id: &str) -> String {
    tier_by_id(tier_id)
        .map(|s| s.display_name.to_string())
        .unwrap_or_else(|| format!("NVIDIA {tier_id}"))
}
