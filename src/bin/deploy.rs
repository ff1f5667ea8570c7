//! visgate-deploy - submit a deployment and wait for it to become ready.
//!
//! Exit codes: 0 success, 1 usage error, 2 validation failure,
//! 3 provider failure, 4 timeout.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};

#[derive(Parser, Debug)]
#[command(name = "visgate-deploy")]
#[command(about = "Deploy a Hugging Face model through a visgate gateway")]
struct Args {
    /// Gateway base URL
    #[arg(long, default_value = "http://localhost:8000")]
    api_base: String,

    /// Hugging Face model id (e.g. stabilityai/sd-turbo)
    #[arg(long)]
    model: String,

    /// Provider API key (falls back to PROVIDER_API_KEY)
    #[arg(long)]
    provider_key: Option<String>,

    /// Webhook URL reported to the gateway
    #[arg(long)]
    webhook_url: String,

    /// GPU tier hint (e.g. A10, A40)
    #[arg(long)]
    gpu_tier: Option<String>,

    /// Hugging Face token for gated models (falls back to HF_TOKEN)
    #[arg(long)]
    hf_token: Option<String>,

    /// Seconds between status polls
    #[arg(long, default_value_t = 5)]
    poll_interval: u64,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 1500)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // clap's help/version exits are successes, not usage errors.
            if e.use_stderr() {
                eprintln!("{e}");
                return ExitCode::from(1);
            }
            println!("{e}");
            return ExitCode::SUCCESS;
        }
    };

    let provider_key = args
        .provider_key
        .clone()
        .or_else(|| std::env::var("PROVIDER_API_KEY").ok());
    let Some(provider_key) = provider_key else {
        eprintln!("error: provider key required (--provider-key or PROVIDER_API_KEY)");
        return ExitCode::from(1);
    };
    let hf_token = args
        .hf_token
        .clone()
        .or_else(|| std::env::var("HF_TOKEN").ok());

    match run(&args, &provider_key, hf_token.as_deref()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(3)
        }
    }
}

async fn run(
    args: &Args,
    provider_key: &str,
    hf_token: Option<&str>,
) -> Result<ExitCode, reqwest::Error> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("reqwest client");

    let mut body = json!({
        "hf_model_id": args.model,
        "user_webhook_url": args.webhook_url,
    });
    if let Some(tier) = &args.gpu_tier {
        body["gpu_tier"] = json!(tier);
    }
    if let Some(token) = hf_token {
        body["hf_token"] = json!(token);
    }

    let base = args.api_base.trim_end_matches('/');
    let resp = client
        .post(format!("{base}/v1/deployments"))
        .bearer_auth(provider_key)
        .json(&body)
        .send()
        .await?;

    let status = resp.status();
    let reply: Value = resp.json().await?;
    if status.as_u16() != 202 {
        eprintln!(
            "request rejected ({status}): {}",
            reply["message"].as_str().unwrap_or("unknown error")
        );
        return Ok(ExitCode::from(if status.is_client_error() { 2 } else { 3 }));
    }

    let deployment_id = reply["deployment_id"].as_str().unwrap_or_default().to_string();
    println!("accepted: {deployment_id}");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.timeout);
    loop {
        if tokio::time::Instant::now() >= deadline {
            eprintln!("timed out waiting for {deployment_id}");
            return Ok(ExitCode::from(4));
        }
        tokio::time::sleep(Duration::from_secs(args.poll_interval)).await;

        let snapshot: Value = client
            .get(format!("{base}/v1/deployments/{deployment_id}"))
            .bearer_auth(provider_key)
            .send()
            .await?
            .json()
            .await?;

        let status = snapshot["status"].as_str().unwrap_or_default();
        println!("status: {status}");
        match status {
            "ready" | "webhook_failed" => {
                println!(
                    "endpoint: {}",
                    snapshot["endpoint_url"].as_str().unwrap_or("<missing>")
                );
                return Ok(ExitCode::SUCCESS);
            }
            "failed" => {
                let kind = snapshot["error"]["kind"].as_str().unwrap_or_default();
                eprintln!(
                    "deployment failed: {}",
                    snapshot["error"]["message"].as_str().unwrap_or("unknown")
                );
                let code = match kind {
                    "ModelNotFoundError" | "ModelGatedError" | "UnsupportedGPUError"
                    | "UnsupportedModelError" | "ValidationError" => 2,
                    _ => 3,
                };
                return Ok(ExitCode::from(code));
            }
            "timeout" => {
                eprintln!("deployment timed out on the provider side");
                return Ok(ExitCode::from(4));
            }
            "deleted" => {
                eprintln!("deployment was deleted");
                return Ok(ExitCode::from(3));
            }
            _ => {}
        }
    }
}
