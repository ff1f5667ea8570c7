//! Indirect model resolution: short model names (optionally scoped by an
//! upstream provider) map to Hugging Face model ids.

use crate::error::VisgateError;

/// (provider, model_name) -> hf_model_id. A `None` provider entry matches
/// any provider once the scoped lookup misses.
const MODEL_NAME_TO_HF: &[(Option<&str>, &str, &str)] = &[
    (Some("fal"), "veo3", "black-forest-labs/FLUX.1-schnell"),
    (Some("fal"), "veo2", "black-forest-labs/FLUX.1-schnell"),
    (None, "veo3", "black-forest-labs/FLUX.1-schnell"),
    (None, "flux-schnell", "black-forest-labs/FLUX.1-schnell"),
    (None, "flux-dev", "black-forest-labs/FLUX.1-dev"),
    (None, "sdxl-turbo", "stabilityai/sdxl-turbo"),
    (None, "sd-turbo", "stabilityai/sd-turbo"),
];

/// Resolve a model name (+ optional provider) to a Hugging Face model id.
/// Tries the provider-scoped entry first, then the provider-agnostic one.
pub fn resolve_model_name(
    model_name: &str,
    provider: Option<&str>,
) -> Result<String, VisgateError> {
    let name = model_name.trim();
    if name.is_empty() {
        return Err(VisgateError::Validation("model_name must not be empty".into()));
    }
    let prov = provider
        .map(|p| p.trim().to_ascii_lowercase())
        .filter(|p| !p.is_empty());

    for scoped in [prov.as_deref(), None] {
        if let Some((_, _, hf_id)) = MODEL_NAME_TO_HF
            .iter()
            .find(|(p, n, _)| *p == scoped && n.eq_ignore_ascii_case(name))
        {
            return Ok(hf_id.to_string());
        }
    }

    let key = match prov {
        Some(p) => format!("{p}.{name}"),
        None => name.to_string(),
    };
    Err(VisgateError::Validation(format!("Unknown model: {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_scoped_lookup_wins() {
        assert_eq!(
            resolve_model_name("veo3", Some("fal")).unwrap(),
            "black-forest-labs/FLUX.1-schnell"
        );
    }

    #[test]
    fn falls_back_to_provider_agnostic() {
        assert_eq!(
            resolve_model_name("flux-dev", Some("someone-else")).unwrap(),
            "black-forest-labs/FLUX.1-dev"
        );
        assert_eq!(
            resolve_model_name("sdxl-turbo", None).unwrap(),
            "stabilityai/sdxl-turbo"
        );
    }

    #[test]
    fn unknown_name_is_validation_error() {
        let err = resolve_model_name("imaginary", None).unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
        let err = resolve_model_name("", Some("fal")).unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }
}
