// Rust Image Scraper Library
//
// Finds every image a page references, either from the raw HTML or from a
// headless-browser render, and reports dimensions, type and size for each.

pub mod api;
pub mod config;
pub mod error;
pub mod human;
pub mod identity;
pub mod images;
pub mod logging;
pub mod orchestrator;
pub mod probe;
pub mod proxy;
pub mod render;
pub mod security;
pub mod static_extractor;
pub mod utils;

// Re-export main types for convenience
pub use config::AppConfig;
pub use error::{RenderFailureKind, ScrapeError};
pub use identity::{Identity, IdentityPool};
pub use images::{ExtractionResult, ImageRecord, ImageSource, InlineImage, RemoteImage};
pub use orchestrator::{Extractor, Method, Orchestrator, ScrapeFailure, ScrapeMode, ScrapeOutcome};
pub use proxy::{Proxy, ProxyManager};
pub use render::RenderExtractor;
pub use static_extractor::StaticExtractor;
