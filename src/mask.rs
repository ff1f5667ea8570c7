//! Secret masking for log output.
//!
//! Secret-bearing values (provider keys, HF tokens, S3 credentials) are
//! reduced to a prefix + suffix form before they reach a log line. Callers
//! that log a worker environment use [`masked_env`]; single values go
//! through [`mask_secret`]; caller webhook targets through [`mask_url`].

use std::collections::BTreeMap;

/// Worker env vars whose values are secrets.
const SENSITIVE_ENV_KEYS: &[&str] = &[
    "HF_TOKEN",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "VISGATE_WEBHOOK_SECRET",
];

/// Reduce a secret to `<first 4>***<last 2>` with the middle elided.
/// Short values are fully elided.
pub fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    if secret.len() <= 8 {
        return "***".to_string();
    }
    format!("{}***{}", &secret[..4], &secret[secret.len() - 2..])
}

/// Copy of a worker environment that is safe to log: values of sensitive
/// keys are masked, everything else passes through.
pub fn masked_env(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .map(|(key, value)| {
            let value = if SENSITIVE_ENV_KEYS.contains(&key.as_str()) {
                mask_secret(value)
            } else {
                value.clone()
            };
            (key.clone(), value)
        })
        .collect()
}

/// Mask the query portion of a URL that may carry credentials.
/// Used when logging caller webhook targets.
pub fn mask_url(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{base}?***"),
        None => url.to_string(),
    }
}
