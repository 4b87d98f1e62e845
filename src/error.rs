use thiserror::Error;

/// Categories a render-engine failure is folded into before it reaches the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderFailureKind {
    Crashed,
    NavigationTimeout,
    LaunchFailed,
}

impl RenderFailureKind {
    pub fn message(&self) -> &'static str {
        match self {
            RenderFailureKind::Crashed => "render engine crashed, likely memory exhaustion",
            RenderFailureKind::NavigationTimeout => {
                "page load timeout, site may be slow or blocking automation"
            }
            RenderFailureKind::LaunchFailed => {
                "render engine failed to start, missing runtime dependency"
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    /// Missing or unsafe target URL. Nothing was attempted.
    #[error("{0}")]
    Validation(String),

    /// Fetch timeout, oversized body or an HTTP error status.
    #[error("{0}")]
    Transport(String),

    #[error("{}", .kind.message())]
    RenderLifecycle {
        kind: RenderFailureKind,
        source: anyhow::Error,
    },

    /// Per-image metadata failure; callers always recover from it.
    #[error("probe failed: {0}")]
    Probe(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ScrapeError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        ScrapeError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for ScrapeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ScrapeError::Transport(format!("request timed out: {}", err))
        } else {
            ScrapeError::Transport(err.to_string())
        }
    }
}

/// Folds a raw browser-automation error into one of the known failure categories.
///
/// Errors that match none of them are handed back unchanged.
pub fn classify_render_error(err: anyhow::Error) -> ScrapeError {
    let text = format!("{:#}", err).to_lowercase();

    let kind = if text.contains("target closed")
        || text.contains("crash")
        || text.contains("disconnected")
        || text.contains("connection closed")
        || text.contains("channel closed")
        || text.contains("websocket")
    {
        Some(RenderFailureKind::Crashed)
    } else if text.contains("navigation") && text.contains("time") {
        Some(RenderFailureKind::NavigationTimeout)
    } else if text.contains("launch")
        || text.contains("executable")
        || text.contains("could not auto detect")
        || text.contains("no such file")
    {
        Some(RenderFailureKind::LaunchFailed)
    } else {
        None
    };

    match kind {
        Some(kind) => ScrapeError::RenderLifecycle { kind, source: err },
        None => ScrapeError::Other(err),
    }
}
