use url::Url;

use crate::error::ScrapeError;

/// Fallback user agent for plain HTTP fetches.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";

/// Read a response body, failing once it grows past `limit` bytes.
pub async fn read_body_capped(
    mut response: reqwest::Response,
    limit: u64,
) -> Result<Vec<u8>, ScrapeError> {
    if let Some(len) = response.content_length() {
        if len > limit {
            return Err(ScrapeError::Transport(format!(
                "Response too large: {} bytes (limit {})",
                len, limit
            )));
        }
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        body.extend_from_slice(&chunk);
        if body.len() as u64 > limit {
            return Err(ScrapeError::Transport(format!(
                "Response exceeded {} bytes",
                limit
            )));
        }
    }
    Ok(body)
}

/// Resolve `src` against `base`.
///
/// Protocol-relative references take the base's scheme. Returns `None` for
/// references that cannot be resolved or that are not fetchable images
/// (`data:` and `javascript:` URLs).
pub fn resolve_url(base: &Url, src: &str) -> Option<String> {
    let src = src.trim();
    if src.is_empty() {
        return None;
    }

    let resolved = if let Some(rest) = src.strip_prefix("//") {
        Url::parse(&format!("{}://{}", base.scheme(), rest)).ok()?
    } else {
        base.join(src).ok()?
    };

    match resolved.scheme() {
        "data" | "javascript" => None,
        _ => Some(resolved.to_string()),
    }
}

/// Last path segment of a URL, percent-decoded. `"image"` when there is none.
pub fn file_name_from_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let last = without_query.rsplit('/').next().unwrap_or("");
    if last.is_empty() {
        return "image".to_string();
    }
    urlencoding::decode(last)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| "image".to_string())
}

/// Extension-derived image type, kept only when it is short enough to be one.
pub fn type_from_extension(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let last = without_query.rsplit('/').next().unwrap_or("");
    let (_, ext) = last.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 {
        return None;
    }
    Some(ext.to_lowercase())
}

/// First URL of a `srcset`-like candidate list.
pub fn first_candidate(value: &str) -> &str {
    let first = value.split(',').next().unwrap_or(value).trim();
    first.split_whitespace().next().unwrap_or(first)
}

/// Parse a `sizes="WxH"` attribute. Only the first size is used.
pub fn parse_sizes(sizes: &str) -> Option<(u32, u32)> {
    let first = sizes.split_whitespace().next()?;
    let lower = first.to_lowercase();
    let (w, h) = lower.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}
