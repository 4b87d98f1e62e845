use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashSet;
use url::Url;

use crate::utils::{file_name_from_url, resolve_url, type_from_extension};

const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "svg", "webp", "bmp", "ico", "avif", "tif", "tiff",
];

/// Where on the page a remote image was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    Img,
    Object,
    Favicon,
    Background,
}

/// Icon and preview-image families recognised in `<link>` and `<meta>` tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IconKind {
    AppleTouch,
    MaskIcon,
    OpenGraph,
    TwitterCard,
    WindowsTile,
    Favicon,
}

impl IconKind {
    /// Classify by a link's `rel` or a meta tag's `property`/`name`.
    pub fn classify(rel_or_name: &str) -> Option<Self> {
        let value = rel_or_name.trim().to_lowercase();
        if value.contains("apple-touch-icon") {
            Some(IconKind::AppleTouch)
        } else if value.split_whitespace().any(|t| t == "mask-icon") {
            Some(IconKind::MaskIcon)
        } else if matches!(
            value.as_str(),
            "og:image" | "og:image:url" | "og:image:secure_url"
        ) {
            Some(IconKind::OpenGraph)
        } else if matches!(value.as_str(), "twitter:image" | "twitter:image:src") {
            Some(IconKind::TwitterCard)
        } else if value == "msapplication-tileimage"
            || (value.starts_with("msapplication-") && value.ends_with("logo"))
        {
            Some(IconKind::WindowsTile)
        } else if value.split_whitespace().any(|t| t == "icon") {
            Some(IconKind::Favicon)
        } else {
            None
        }
    }

    pub fn alt_text(&self) -> &'static str {
        match self {
            IconKind::AppleTouch => "Apple Touch Icon",
            IconKind::MaskIcon => "Safari Mask Icon",
            IconKind::OpenGraph => "Open Graph Image",
            IconKind::TwitterCard => "Twitter Card Image",
            IconKind::WindowsTile => "Windows Tile Image",
            IconKind::Favicon => "Favicon",
        }
    }
}

fn dash_if_none<T: Serialize, S: Serializer>(value: &Option<T>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(v) => v.serialize(s),
        None => s.serialize_str("-"),
    }
}

/// Vector markup embedded directly in the page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InlineImage {
    pub content: String,
    pub width: String,
    pub height: String,
    #[serde(rename = "type")]
    pub image_type: String,
    pub size: usize,
    pub filename: String,
}

impl InlineImage {
    pub fn new(content: String, width: Option<&str>, height: Option<&str>) -> Self {
        Self {
            size: content.len(),
            content,
            width: width.unwrap_or("-").to_string(),
            height: height.unwrap_or("-").to_string(),
            image_type: "svg".to_string(),
            filename: "-".to_string(),
        }
    }
}

/// An image reachable by URL. Metadata stays unknown until a probe fills it in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteImage {
    pub url: String,
    #[serde(serialize_with = "dash_if_none")]
    pub width: Option<u32>,
    #[serde(serialize_with = "dash_if_none")]
    pub height: Option<u32>,
    #[serde(rename = "type", serialize_with = "dash_if_none")]
    pub image_type: Option<String>,
    #[serde(serialize_with = "dash_if_none")]
    pub size: Option<u64>,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
    pub source: ImageSource,
}

impl RemoteImage {
    pub fn new(url: String, alt: Option<String>, source: ImageSource) -> Self {
        Self {
            filename: file_name_from_url(&url),
            url,
            width: None,
            height: None,
            image_type: None,
            size: None,
            alt,
            source,
        }
    }

    pub fn with_dimensions(mut self, dims: Option<(u32, u32)>) -> Self {
        if let Some((w, h)) = dims {
            self.width = Some(w);
            self.height = Some(h);
        }
        self
    }

    /// Best-effort type from the file extension, used when probing fails.
    pub fn infer_type(&mut self) {
        if self.image_type.is_none() {
            self.image_type = type_from_extension(&self.url);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageRecord {
    Inline(InlineImage),
    Remote(RemoteImage),
}

impl ImageRecord {
    pub fn url(&self) -> Option<&str> {
        match self {
            ImageRecord::Inline(_) => None,
            ImageRecord::Remote(r) => Some(&r.url),
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteImage> {
        match self {
            ImageRecord::Remote(r) => Some(r),
            ImageRecord::Inline(_) => None,
        }
    }
}

impl Serialize for ImageRecord {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Tagged<'a, T> {
            inline: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            url: Option<()>,
            #[serde(flatten)]
            record: &'a T,
        }

        match self {
            ImageRecord::Inline(i) => Tagged {
                inline: true,
                url: Some(()),
                record: i,
            }
            .serialize(s),
            ImageRecord::Remote(r) => Tagged {
                inline: false,
                url: None,
                record: r,
            }
            .serialize(s),
        }
    }
}

/// What one extraction pass produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub images: Vec<ImageRecord>,
    pub head_content: String,
}

impl ExtractionResult {
    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

/// Accumulates images in discovery order, keeping one record per resolved URL.
pub struct ImageCollector {
    base: Url,
    seen: HashSet<String>,
    records: Vec<ImageRecord>,
}

impl ImageCollector {
    pub fn new(base: Url) -> Self {
        Self {
            base,
            seen: HashSet::new(),
            records: Vec::new(),
        }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Resolve and record a remote reference. Returns false for duplicates and
    /// unusable references.
    pub fn add_remote(
        &mut self,
        raw: &str,
        alt: Option<String>,
        source: ImageSource,
        dims: Option<(u32, u32)>,
    ) -> bool {
        let Some(url) = resolve_url(&self.base, raw) else {
            return false;
        };
        if !self.seen.insert(url.clone()) {
            return false;
        }
        let alt = alt.filter(|a| !a.trim().is_empty());
        self.records.push(ImageRecord::Remote(
            RemoteImage::new(url, alt, source).with_dimensions(dims),
        ));
        true
    }

    pub fn add_icon(&mut self, raw: &str, kind: IconKind, sizes: Option<&str>) -> bool {
        let dims = sizes.and_then(crate::utils::parse_sizes);
        self.add_remote(
            raw,
            Some(kind.alt_text().to_string()),
            ImageSource::Favicon,
            dims,
        )
    }

    pub fn add_inline(&mut self, markup: String, width: Option<&str>, height: Option<&str>) {
        self.records
            .push(ImageRecord::Inline(InlineImage::new(markup, width, height)));
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<ImageRecord> {
        self.records
    }
}

/// Whether an `<object data=...>` points at an image.
pub fn is_image_object(data: &str, mime: Option<&str>) -> bool {
    if let Some(mime) = mime {
        if mime.trim().to_lowercase().starts_with("image/") {
            return true;
        }
    }
    type_from_extension(data)
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> ImageCollector {
        ImageCollector::new(Url::parse("https://ex.com/page").unwrap())
    }

    #[test]
    fn test_icon_classification() {
        assert_eq!(IconKind::classify("apple-touch-icon"), Some(IconKind::AppleTouch));
        assert_eq!(
            IconKind::classify("apple-touch-icon-precomposed"),
            Some(IconKind::AppleTouch)
        );
        assert_eq!(IconKind::classify("mask-icon"), Some(IconKind::MaskIcon));
        assert_eq!(IconKind::classify("og:image:secure_url"), Some(IconKind::OpenGraph));
        assert_eq!(IconKind::classify("twitter:image"), Some(IconKind::TwitterCard));
        assert_eq!(
            IconKind::classify("msapplication-TileImage"),
            Some(IconKind::WindowsTile)
        );
        assert_eq!(IconKind::classify("shortcut icon"), Some(IconKind::Favicon));
        assert_eq!(IconKind::classify("stylesheet"), None);
        assert_eq!(IconKind::classify("og:title"), None);
    }

    #[test]
    fn test_image_property_subtags_are_not_images() {
        for name in [
            "og:image:width",
            "og:image:height",
            "og:image:type",
            "og:image:alt",
            "twitter:image:alt",
        ] {
            assert_eq!(IconKind::classify(name), None, "{}", name);
        }
        assert_eq!(IconKind::classify("og:image:url"), Some(IconKind::OpenGraph));
        assert_eq!(IconKind::classify("twitter:image:src"), Some(IconKind::TwitterCard));
    }

    #[test]
    fn test_collector_dedups_by_resolved_url() {
        let mut c = collector();
        assert!(c.add_remote("/a.png", None, ImageSource::Img, None));
        assert!(!c.add_remote("https://ex.com/a.png", None, ImageSource::Background, None));
        assert!(!c.add_remote("data:image/gif;base64,R0lG", None, ImageSource::Img, None));
        assert_eq!(c.len(), 1);
        let records = c.into_records();
        assert_eq!(records[0].as_remote().unwrap().source, ImageSource::Img);
    }

    #[test]
    fn test_icon_sizes_fill_dimensions() {
        let mut c = collector();
        c.add_icon("/apple.png", IconKind::AppleTouch, Some("180x180"));
        let records = c.into_records();
        let icon = records[0].as_remote().unwrap();
        assert_eq!(icon.width, Some(180));
        assert_eq!(icon.height, Some(180));
        assert_eq!(icon.alt.as_deref(), Some("Apple Touch Icon"));
        assert_eq!(icon.source, ImageSource::Favicon);
    }

    #[test]
    fn test_inline_size_is_utf8_length() {
        let markup = "<svg><text>é</text></svg>".to_string();
        let inline = InlineImage::new(markup.clone(), Some("10"), None);
        assert_eq!(inline.size, markup.len());
        assert_eq!(inline.size, 26);
        assert_eq!(inline.height, "-");
    }

    #[test]
    fn test_image_object_detection() {
        assert!(is_image_object("/logo.svg", None));
        assert!(is_image_object("/asset", Some("image/png")));
        assert!(!is_image_object("/movie.swf", Some("application/x-shockwave-flash")));
    }

    #[test]
    fn test_record_serialization() {
        let remote = ImageRecord::Remote(RemoteImage::new(
            "https://ex.com/a.png".to_string(),
            None,
            ImageSource::Img,
        ));
        let json = serde_json::to_value(&remote).unwrap();
        assert_eq!(json["inline"], false);
        assert_eq!(json["url"], "https://ex.com/a.png");
        assert_eq!(json["width"], "-");
        assert_eq!(json["filename"], "a.png");
        assert_eq!(json["source"], "img");

        let inline = ImageRecord::Inline(InlineImage::new("<svg/>".to_string(), None, None));
        let json = serde_json::to_value(&inline).unwrap();
        assert_eq!(json["inline"], true);
        assert_eq!(json["url"], serde_json::Value::Null);
        assert_eq!(json["type"], "svg");
        assert_eq!(json["size"], 6);
    }
}
