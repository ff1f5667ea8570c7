//! Static model catalog: known diffusion models and their VRAM floors.
//!
//! `min_vram_gb` is the minimum GPU memory required to *run* the model
//! (weights + activations + CUDA context), not the raw weight size. A
//! registry hit is authoritative and skips both the Hub metadata fetch and
//! the byte estimator. Unknown ids return `None` and callers fall through to
//! [`crate::estimator`].

use std::collections::HashMap;
use std::sync::OnceLock;

/// Read-only entry for a known model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    pub hf_model_id: &'static str,
    pub pipeline_tag: &'static str,
    pub min_vram_gb: u32,
    pub notes: &'static str,
}

const MODEL_SPECS: &[ModelSpec] = &[
    // Flux family
    ModelSpec {
        hf_model_id: "black-forest-labs/FLUX.1-schnell",
        pipeline_tag: "text-to-image",
        min_vram_gb: 16,
        notes: "12 GB weights + activation headroom",
    },
    ModelSpec {
        hf_model_id: "black-forest-labs/FLUX.1-dev",
        pipeline_tag: "text-to-image",
        min_vram_gb: 28,
        notes: "24 GB weights; 24 GB cards OOM",
    },
    // SDXL family
    ModelSpec {
        hf_model_id: "stabilityai/stable-diffusion-xl-base-1.0",
        pipeline_tag: "text-to-image",
        min_vram_gb: 12,
        notes: "",
    },
    ModelSpec {
        hf_model_id: "stabilityai/sdxl-turbo",
        pipeline_tag: "text-to-image",
        min_vram_gb: 10,
        notes: "",
    },
    // SD-Turbo / SD 2.x / SD 1.x
    ModelSpec {
        hf_model_id: "stabilityai/sd-turbo",
        pipeline_tag: "text-to-image",
        min_vram_gb: 8,
        notes: "",
    },
    ModelSpec {
        hf_model_id: "stabilityai/stable-diffusion-2-1",
        pipeline_tag: "text-to-image",
        min_vram_gb: 8,
        notes: "",
    },
    ModelSpec {
        hf_model_id: "runwayml/stable-diffusion-v1-5",
        pipeline_tag: "text-to-image",
        min_vram_gb: 6,
        notes: "",
    },
    // SD 3.x
    ModelSpec {
        hf_model_id: "stabilityai/stable-diffusion-3-medium-diffusers",
        pipeline_tag: "text-to-image",
        min_vram_gb: 18,
        notes: "",
    },
    ModelSpec {
        hf_model_id: "stabilityai/stable-diffusion-3.5-large",
        pipeline_tag: "text-to-image",
        min_vram_gb: 40,
        notes: "",
    },
    ModelSpec {
        hf_model_id: "stabilityai/stable-diffusion-3.5-large-turbo",
        pipeline_tag: "text-to-image",
        min_vram_gb: 40,
        notes: "",
    },
    ModelSpec {
        hf_model_id: "stabilityai/stable-diffusion-3.5-medium",
        pipeline_tag: "text-to-image",
        min_vram_gb: 18,
        notes: "",
    },
    // PixArt
    ModelSpec {
        hf_model_id: "PixArt-alpha/PixArt-Sigma-XL-2-1024-MS",
        pipeline_tag: "text-to-image",
        min_vram_gb: 18,
        notes: "",
    },
    // Kandinsky
    ModelSpec {
        hf_model_id: "kandinsky-community/kandinsky-2-2-decoder",
        pipeline_tag: "text-to-image",
        min_vram_gb: 10,
        notes: "",
    },
    // DeepFloyd IF
    ModelSpec {
        hf_model_id: "DeepFloyd/IF-I-XL-v1.0",
        pipeline_tag: "text-to-image",
        min_vram_gb: 40,
        notes: "gated",
    },
    // Wan video
    ModelSpec {
        hf_model_id: "Wan-AI/Wan2.1-T2V-14B-Diffusers",
        pipeline_tag: "text-to-video",
        min_vram_gb: 80,
        notes: "",
    },
    ModelSpec {
        hf_model_id: "Wan-AI/Wan2.1-T2V-1.3B-Diffusers",
        pipeline_tag: "text-to-video",
        min_vram_gb: 16,
        notes: "",
    },
    // CogVideoX
    ModelSpec {
        hf_model_id: "THUDM/CogVideoX-5b",
        pipeline_tag: "text-to-video",
        min_vram_gb: 48,
        notes: "",
    },
];

fn index() -> &'static HashMap<&'static str, &'static ModelSpec> {
    static INDEX: OnceLock<HashMap<&'static str, &'static ModelSpec>> = OnceLock::new();
    INDEX.get_or_init(|| MODEL_SPECS.iter().map(|s| (s.hf_model_id, s)).collect())
}

/// Look up a registered model. `None` means "not registered", which sends
/// the caller down the estimator path.
pub fn model_spec(hf_model_id: &str) -> Option<&'static ModelSpec> {
    index().get(hf_model_id).copied()
}
