//! Structured log helpers. Fields are rendered as a compact JSON object after
//! the message so they stay greppable in plain `env_logger` output.

use env_logger::Env;
use serde_json::{Value, json};

use crate::render::browser::FailedRequest;

pub fn init() {
    env_logger::init_from_env(Env::new().default_filter_or("info"));
}

/// Short per-request id for correlating log lines.
pub fn request_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

pub fn fields(message: &str, fields: &Value) -> String {
    match fields {
        Value::Object(map) if map.is_empty() => message.to_string(),
        Value::Null => message.to_string(),
        _ => format!("{} {}", message, fields),
    }
}

/// `error` followed by each of its sources, colon separated.
pub fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut chain = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !chain.ends_with(&text) {
            chain.push_str(": ");
            chain.push_str(&text);
        }
        source = cause.source();
    }
    chain
}

pub fn log_scraping_error(
    url: &str,
    method: &str,
    error: &(dyn std::error::Error + 'static),
    context: Value,
) {
    log::error!(
        "{}",
        fields(
            "Scraping failed",
            &json!({
                "url": url,
                "method": method,
                "error": error_chain(error),
                "context": context,
            })
        )
    );
}

pub fn log_browser_console(url: &str, messages: &[String]) {
    if messages.is_empty() {
        return;
    }
    log::info!(
        "{}",
        fields(
            "Browser console output",
            &json!({ "url": url, "count": messages.len(), "messages": messages })
        )
    );
}

pub fn log_network_failure(url: &str, failed: &[FailedRequest], error_responses: &[FailedRequest]) {
    if failed.is_empty() && error_responses.is_empty() {
        return;
    }
    log::warn!(
        "{}",
        fields(
            "Network failures while rendering",
            &json!({
                "url": url,
                "failedRequests": failed,
                "errorResponses": error_responses,
            })
        )
    );
}
