//! b24-call
//!
//! Calls one REST method against the portal configured through `B24_*`
//! environment variables and prints the result as JSON.
//!
//! ```text
//! b24-call <method> [json-params] [--all]
//! ```
//!
//! `--all` reads every page of a list method. With `B24_LOG_DIR` set, logs
//! also go to a daily file in that directory.

use anyhow::{bail, Context, Result};
use b24_client::logging::{init_console_logging, init_logging};
use b24_client::{B24Client, ClientConfig, Paging};
use serde_json::{json, Value};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    match std::env::var_os("B24_LOG_DIR") {
        Some(dir) => init_logging(dir, "b24-call")?,
        None => init_console_logging(),
    }

    let mut all = false;
    let mut positional = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--all" => all = true,
            "-h" | "--help" => {
                eprintln!("usage: b24-call <method> [json-params] [--all]");
                return Ok(());
            }
            _ => positional.push(arg),
        }
    }

    let Some(method) = positional.first() else {
        bail!("usage: b24-call <method> [json-params] [--all]");
    };
    let params: Value = match positional.get(1) {
        Some(raw) => serde_json::from_str(raw).context("params must be a JSON object")?,
        None => json!({}),
    };

    let config = ClientConfig::from_env().context("Failed to read B24_* configuration")?;
    info!(version = %config.version, "Calling {}", method);
    let client = B24Client::new(config)?;

    let output = if all {
        let envelope = client.call_list_method(method, params, None).await?;
        if !envelope.is_success() {
            bail!("{}", envelope.error_messages().join("; "));
        }
        Value::Array(envelope.into_data().unwrap_or_default())
    } else {
        let envelope = client.call_method(method, params, Paging::Default).await?;
        if !envelope.is_success() {
            bail!("{}", envelope.error_messages().join("; "));
        }
        json!({
            "result": envelope.data(),
            "total": envelope.total(),
            "time": envelope.time(),
        })
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
