use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;
use std::time::Duration;
use url::Url;

use crate::error::ScrapeError;
use crate::images::{ExtractionResult, IconKind, ImageCollector, ImageSource, is_image_object};
use crate::probe::{ImageEnricher, MAX_IMAGE_BYTES};
use crate::utils::{DEFAULT_USER_AGENT, first_candidate, read_body_capped};

/// Attributes lazy-loading libraries park the real image URL in, in lookup order.
pub const LAZY_ATTRIBUTES: &[&str] = &[
    "data-src",
    "data-original",
    "data-url",
    "data-lazy",
    "data-srcset",
    "data-lazy-src",
];

static CSS_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)url\(\s*['"]?([^'")]+?)['"]?\s*\)"#).expect("valid regex")
});

macro_rules! selector {
    ($name:ident, $css:expr) => {
        static $name: LazyLock<Selector> =
            LazyLock::new(|| Selector::parse($css).expect("valid selector"));
    };
}

selector!(BASE_HREF, "base[href]");
selector!(HEAD, "head");
selector!(IMG, "img");
selector!(INLINE_STYLE_URL, r#"[style*="url("]"#);
selector!(SVG, "svg");
selector!(OBJECT_DATA, "object[data]");
selector!(ICON_LINK, "link[rel][href]");
selector!(META_CONTENT, "meta[content]");

#[derive(Debug, Clone)]
pub struct StaticConfig {
    pub timeout: Duration,
    pub max_body_bytes: u64,
}

impl Default for StaticConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(8),
            max_body_bytes: MAX_IMAGE_BYTES,
        }
    }
}

/// Fetches raw HTML and pulls images out of it without running page scripts.
pub struct StaticExtractor {
    client: reqwest::Client,
    config: StaticConfig,
    enricher: ImageEnricher,
}

impl StaticExtractor {
    pub fn new(config: StaticConfig, enricher: ImageEnricher) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .cookie_store(true)
            .build()?;

        Ok(Self {
            client,
            config,
            enricher,
        })
    }

    pub async fn extract(&self, url: &str, lazy: bool) -> Result<ExtractionResult, ScrapeError> {
        let page_url =
            Url::parse(url).map_err(|e| ScrapeError::Validation(format!("Invalid URL: {}", e)))?;

        let html = self.fetch_page(url).await?;
        let mut result = parse_page(&html, &page_url, lazy);
        log::debug!(
            "Static parse of {} found {} candidate images",
            url,
            result.images.len()
        );

        result.images = self.enricher.enrich(result.images).await;
        Ok(result)
    }

    async fn fetch_page(&self, url: &str) -> Result<String, ScrapeError> {
        let response = self
            .client
            .get(url)
            .header("User-Agent", DEFAULT_USER_AGENT)
            .header(
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header("Accept-Language", "en-US,en;q=0.5")
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(ScrapeError::Transport(format!("HTTP error: {}", status)));
        }

        let body = read_body_capped(response, self.config.max_body_bytes).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// Extract every image reference from a parsed document, unenriched.
pub fn parse_page(html: &str, page_url: &Url, lazy: bool) -> ExtractionResult {
    let document = Html::parse_document(html);
    let mut images = ImageCollector::new(resolution_base(&document, page_url));

    collect_img_elements(&document, &mut images, lazy);
    collect_inline_backgrounds(&document, &mut images);
    collect_inline_svgs(&document, &mut images);
    collect_objects(&document, &mut images);
    collect_icons(&document, &mut images);

    let head_content = document
        .select(&HEAD)
        .next()
        .map(|h| h.inner_html())
        .unwrap_or_default();

    ExtractionResult {
        images: images.into_records(),
        head_content,
    }
}

/// `<base href>` when present and resolvable, the request URL otherwise.
fn resolution_base(document: &Html, page_url: &Url) -> Url {
    document
        .select(&BASE_HREF)
        .next()
        .and_then(|b| b.value().attr("href"))
        .and_then(|href| page_url.join(href.trim()).ok())
        .unwrap_or_else(|| page_url.clone())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// The URL an `<img>` will load: `src`, then lazy attributes, then `srcset`.
fn img_source(el: &ElementRef, lazy: bool) -> Option<String> {
    if let Some(src) = non_empty(el.value().attr("src")) {
        return Some(src.to_string());
    }
    if !lazy {
        return None;
    }

    LAZY_ATTRIBUTES
        .iter()
        .find_map(|attr| non_empty(el.value().attr(attr)))
        .or_else(|| non_empty(el.value().attr("srcset")))
        .map(|value| first_candidate(value).to_string())
}

fn collect_img_elements(document: &Html, images: &mut ImageCollector, lazy: bool) {
    for el in document.select(&IMG) {
        if let Some(src) = img_source(&el, lazy) {
            let alt = el.value().attr("alt").map(str::to_string);
            images.add_remote(&src, alt, ImageSource::Img, None);
        }
    }
}

fn collect_inline_backgrounds(document: &Html, images: &mut ImageCollector) {
    for el in document.select(&INLINE_STYLE_URL) {
        let Some(style) = el.value().attr("style") else {
            continue;
        };
        for caps in CSS_URL.captures_iter(style) {
            if let Some(raw) = caps.get(1) {
                images.add_remote(raw.as_str(), None, ImageSource::Background, None);
            }
        }
    }
}

fn collect_inline_svgs(document: &Html, images: &mut ImageCollector) {
    for el in document.select(&SVG) {
        // nested <svg> is already part of its parent's markup
        let nested = el
            .ancestors()
            .filter_map(ElementRef::wrap)
            .any(|a| a.value().name() == "svg");
        if nested {
            continue;
        }
        images.add_inline(
            el.html(),
            el.value().attr("width"),
            el.value().attr("height"),
        );
    }
}

fn collect_objects(document: &Html, images: &mut ImageCollector) {
    for el in document.select(&OBJECT_DATA) {
        let Some(data) = non_empty(el.value().attr("data")) else {
            continue;
        };
        if is_image_object(data, el.value().attr("type")) {
            images.add_remote(data, None, ImageSource::Object, None);
        }
    }
}

fn collect_icons(document: &Html, images: &mut ImageCollector) {
    for el in document.select(&ICON_LINK) {
        let rel = el.value().attr("rel").unwrap_or_default();
        let (Some(kind), Some(href)) = (IconKind::classify(rel), non_empty(el.value().attr("href")))
        else {
            continue;
        };
        images.add_icon(href, kind, el.value().attr("sizes"));
    }

    for el in document.select(&META_CONTENT) {
        let key = el
            .value()
            .attr("property")
            .or_else(|| el.value().attr("name"))
            .unwrap_or_default();
        let (Some(kind), Some(content)) =
            (IconKind::classify(key), non_empty(el.value().attr("content")))
        else {
            continue;
        };
        images.add_icon(content, kind, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::ImageRecord;
    use crate::probe::{EnrichConfig, ImageMeta, ImageProbe};
    use async_trait::async_trait;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn parse(html: &str, url: &str) -> ExtractionResult {
        parse_page(html, &Url::parse(url).unwrap(), true)
    }

    fn urls(result: &ExtractionResult) -> Vec<&str> {
        result.images.iter().filter_map(|r| r.url()).collect()
    }

    struct NoProbe;

    #[async_trait]
    impl ImageProbe for NoProbe {
        async fn probe(&self, _url: &str) -> Result<ImageMeta, ScrapeError> {
            Err(ScrapeError::Probe("offline".to_string()))
        }
    }

    fn extractor() -> StaticExtractor {
        let enricher = ImageEnricher::new(Arc::new(NoProbe), EnrichConfig::default());
        StaticExtractor::new(StaticConfig::default(), enricher).unwrap()
    }

    #[test]
    fn test_base_href_wins_over_request_url() {
        let html = r#"<html><head><base href="https://ex.com/sub/"></head>
            <body><img src="/a.png"><img src="b.png"></body></html>"#;
        let result = parse(html, "https://ex.com/page");
        assert_eq!(urls(&result), vec!["https://ex.com/a.png", "https://ex.com/sub/b.png"]);
    }

    #[test]
    fn test_lazy_attributes_and_srcset() {
        let html = r#"<body>
            <img data-original="/lazy1.jpg">
            <img data-src="/lazy2.jpg" data-original="/ignored.jpg">
            <img data-srcset="/small.jpg 1x, /big.jpg 2x">
            <img srcset="/s.jpg 480w, /l.jpg 1080w">
            <img src="">
        </body>"#;
        let result = parse(html, "https://ex.com/");
        assert_eq!(
            urls(&result),
            vec![
                "https://ex.com/lazy1.jpg",
                "https://ex.com/lazy2.jpg",
                "https://ex.com/small.jpg",
                "https://ex.com/s.jpg",
            ]
        );
    }

    #[test]
    fn test_lazy_disabled_only_reads_src() {
        let html = r#"<img data-src="/lazy.jpg"><img src="/real.jpg">"#;
        let result = parse_page(html, &Url::parse("https://ex.com/").unwrap(), false);
        assert_eq!(urls(&result), vec!["https://ex.com/real.jpg"]);
    }

    #[test]
    fn test_inline_background_urls() {
        let html = r#"<div style="background: url('/bg1.jpg'), url(&quot;/bg2.png&quot;)"></div>
            <section style="background-image:url(//cdn.ex.com/hero.webp)"></section>
            <span style="background:url(data:image/png;base64,AAA)"></span>"#;
        let result = parse(html, "https://ex.com/");
        assert_eq!(
            urls(&result),
            vec![
                "https://ex.com/bg1.jpg",
                "https://ex.com/bg2.png",
                "https://cdn.ex.com/hero.webp",
            ]
        );
        let first = result.images[0].as_remote().unwrap();
        assert_eq!(first.source, ImageSource::Background);
    }

    #[test]
    fn test_same_url_as_img_and_background_is_one_record() {
        let html = r#"<img src="/dup.png"><div style="background:url(/dup.png)"></div>"#;
        let result = parse(html, "https://ex.com/");
        assert_eq!(result.images.len(), 1);
        assert_eq!(result.images[0].as_remote().unwrap().source, ImageSource::Img);
    }

    #[test]
    fn test_inline_svg() {
        let html = r#"<svg width="24" height="24"><svg><circle r="2"/></svg></svg>"#;
        let result = parse(html, "https://ex.com/");
        assert_eq!(result.images.len(), 1);
        match &result.images[0] {
            ImageRecord::Inline(svg) => {
                assert_eq!(svg.width, "24");
                assert!(svg.content.starts_with("<svg"));
                assert_eq!(svg.size, svg.content.len());
            }
            other => panic!("expected inline svg, got {:?}", other),
        }
    }

    #[test]
    fn test_object_images() {
        let html = r#"<object data="/logo.svg"></object>
            <object data="/chart" type="image/png"></object>
            <object data="/movie.swf" type="application/x-shockwave-flash"></object>"#;
        let result = parse(html, "https://ex.com/");
        assert_eq!(urls(&result), vec!["https://ex.com/logo.svg", "https://ex.com/chart"]);
    }

    #[test]
    fn test_icons_and_meta_images() {
        let html = r#"<head>
            <link rel="icon" href="/favicon.ico">
            <link rel="apple-touch-icon" sizes="180x180" href="/apple.png">
            <link rel="stylesheet" href="/site.css">
            <meta property="og:image" content="https://ex.com/og.jpg">
            <meta name="twitter:image" content="/tw.jpg">
            <meta name="msapplication-TileImage" content="/tile.png">
            <meta name="description" content="not an image">
        </head>"#;
        let result = parse(html, "https://ex.com/");
        let remotes: Vec<_> = result.images.iter().filter_map(|r| r.as_remote()).collect();
        assert_eq!(remotes.len(), 5);
        assert!(remotes.iter().all(|r| r.source == ImageSource::Favicon));

        let apple = remotes.iter().find(|r| r.url.ends_with("apple.png")).unwrap();
        assert_eq!(apple.alt.as_deref(), Some("Apple Touch Icon"));
        assert_eq!((apple.width, apple.height), (Some(180), Some(180)));

        let og = remotes.iter().find(|r| r.url.ends_with("og.jpg")).unwrap();
        assert_eq!(og.alt.as_deref(), Some("Open Graph Image"));
    }

    #[test]
    fn test_open_graph_subtags_are_skipped() {
        let html = r#"<head>
            <meta property="og:image" content="https://ex.com/og.jpg">
            <meta property="og:image:width" content="1200">
            <meta property="og:image:height" content="630">
            <meta property="og:image:type" content="image/jpeg">
            <meta property="og:image:alt" content="A nice picture">
            <meta name="twitter:image:alt" content="Cover art">
        </head>"#;
        let result = parse(html, "https://ex.com/post/");
        assert_eq!(urls(&result), vec!["https://ex.com/og.jpg"]);
    }

    #[test]
    fn test_duplicate_favicons_collapse() {
        let html = r#"<head><link rel="icon" href="/f.ico"><link rel="shortcut icon" href="https://ex.com/f.ico"></head>"#;
        let result = parse(html, "https://ex.com/");
        assert_eq!(result.images.len(), 1);
        let icon = result.images[0].as_remote().unwrap();
        assert_eq!(icon.source, ImageSource::Favicon);
    }

    #[test]
    fn test_head_content() {
        let html = "<html><head><title>Hi</title></head><body></body></html>";
        let result = parse(html, "https://ex.com/");
        assert_eq!(result.head_content, "<title>Hi</title>");
    }

    #[tokio::test]
    async fn test_extract_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><head><title>T</title></head><body><img src="/pics/cat.jpeg" alt="cat"></body></html>"#,
            ))
            .mount(&server)
            .await;

        let result = extractor()
            .extract(&format!("{}/page", server.uri()), true)
            .await
            .unwrap();

        assert_eq!(result.images.len(), 1);
        let cat = result.images[0].as_remote().unwrap();
        assert_eq!(cat.url, format!("{}/pics/cat.jpeg", server.uri()));
        assert_eq!(cat.alt.as_deref(), Some("cat"));
        assert_eq!(cat.filename, "cat.jpeg");
        // probe failed, type comes from the extension
        assert_eq!(cat.image_type.as_deref(), Some("jpeg"));
        assert_eq!(cat.width, None);
    }

    #[tokio::test]
    async fn test_extract_http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = extractor()
            .extract(&format!("{}/missing", server.uri()), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Transport(_)));
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_extract_rejects_oversized_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/huge"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(4096)))
            .mount(&server)
            .await;

        let enricher = ImageEnricher::new(Arc::new(NoProbe), EnrichConfig::default());
        let small = StaticExtractor::new(
            StaticConfig {
                max_body_bytes: 1024,
                ..StaticConfig::default()
            },
            enricher,
        )
        .unwrap();

        let err = small
            .extract(&format!("{}/huge", server.uri()), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Transport(_)));
    }
}
