//! JavaScript evaluated inside rendered pages.

use crate::identity::Identity;
use crate::static_extractor::LAZY_ATTRIBUTES;

/// Affirmative labels on cookie/consent banners, lowercase.
pub const CONSENT_PHRASES: &[&str] = &[
    "accept all",
    "accept all cookies",
    "accept cookies",
    "accept",
    "agree",
    "i agree",
    "allow all",
    "allow cookies",
    "got it",
    "ok",
    "yes, i agree",
    "alle akzeptieren",
    "tout accepter",
    "aceptar todo",
];

const STEALTH_TEMPLATE: &str = r#"(() => {
  const define = (obj, prop, value) => {
    try { Object.defineProperty(obj, prop, { get: () => value, configurable: true }); } catch (_) {}
  };

  define(Navigator.prototype, 'webdriver', undefined);
  define(navigator, 'languages', __LANGUAGES__);
  define(navigator, 'platform', __PLATFORM__);

  const plugins = [
    { name: 'PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
    { name: 'Chrome PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
    { name: 'Chromium PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
  ];
  define(navigator, 'plugins', plugins);
  define(navigator, 'mimeTypes', [{ type: 'application/pdf', suffixes: 'pdf', description: 'Portable Document Format' }]);

  const patchWebGL = (proto) => {
    if (!proto) return;
    const original = proto.getParameter;
    proto.getParameter = function (param) {
      if (param === 37445) return 'Intel Inc.';
      if (param === 37446) return 'Intel Iris OpenGL Engine';
      return original.call(this, param);
    };
  };
  patchWebGL(window.WebGLRenderingContext && WebGLRenderingContext.prototype);
  patchWebGL(window.WebGL2RenderingContext && WebGL2RenderingContext.prototype);

  const brands = [
    { brand: 'Chromium', version: __MAJOR__ },
    { brand: 'Google Chrome', version: __MAJOR__ },
    { brand: 'Not=A?Brand', version: '24' },
  ];
  // plain data so the object survives structured cloning
  const uaData = { brands, mobile: __MOBILE__, platform: __UA_PLATFORM__ };
  Object.defineProperty(uaData, 'getHighEntropyValues', {
    enumerable: false,
    value: () => Promise.resolve({ ...uaData, platformVersion: '', architecture: 'x86', model: '', uaFullVersion: __MAJOR__ + '.0.0.0' }),
  });
  Object.defineProperty(uaData, 'toJSON', { enumerable: false, value: () => ({ brands, mobile: uaData.mobile, platform: uaData.platform }) });
  define(navigator, 'userAgentData', uaData);

  if (!window.chrome) {
    define(window, 'chrome', { runtime: {} });
  }
})();"#;

/// Automation-hiding patches, consistent with the identity being presented.
pub fn stealth_script(identity: &Identity) -> String {
    let languages = vec![
        identity.locale.to_string(),
        identity
            .locale
            .split('-')
            .next()
            .unwrap_or(identity.locale)
            .to_string(),
    ];

    STEALTH_TEMPLATE
        .replace("__LANGUAGES__", &js_value(&languages))
        .replace("__PLATFORM__", &js_value(&navigator_platform(identity.user_agent)))
        .replace("__UA_PLATFORM__", &js_value(&ua_data_platform(identity.user_agent)))
        .replace("__MAJOR__", &js_value(&chrome_major(identity.user_agent)))
        .replace("__MOBILE__", if identity.is_mobile { "true" } else { "false" })
}

fn js_value<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// `navigator.platform` matching the user agent's OS.
pub fn navigator_platform(user_agent: &str) -> String {
    if user_agent.contains("Windows") {
        "Win32".to_string()
    } else if user_agent.contains("Macintosh") {
        "MacIntel".to_string()
    } else {
        "Linux x86_64".to_string()
    }
}

fn ua_data_platform(user_agent: &str) -> String {
    if user_agent.contains("Windows") {
        "Windows".to_string()
    } else if user_agent.contains("Macintosh") {
        "macOS".to_string()
    } else {
        "Linux".to_string()
    }
}

fn chrome_major(user_agent: &str) -> String {
    user_agent
        .split("Chrome/")
        .nth(1)
        .and_then(|rest| rest.split('.').next())
        .unwrap_or("120")
        .to_string()
}

const CONSENT_TEMPLATE: &str = r#"(() => {
  const phrases = __PHRASES__;
  const candidates = document.querySelectorAll('button, [role="button"], a, input[type="button"], input[type="submit"]');
  for (const el of candidates) {
    const label = ((el.innerText || el.value || el.getAttribute('aria-label') || '') + '').trim().toLowerCase();
    if (!label || label.length > 40) continue;
    if (!phrases.some(p => label === p || label.startsWith(p + ' '))) continue;
    const rect = el.getBoundingClientRect();
    const style = window.getComputedStyle(el);
    if (rect.width === 0 || rect.height === 0 || style.visibility === 'hidden' || style.display === 'none') continue;
    el.click();
    return true;
  }
  return false;
})()"#;

/// Clicks the first visible consent button. Evaluates to whether one was clicked.
pub fn consent_script() -> String {
    CONSENT_TEMPLATE.replace("__PHRASES__", &js_value(CONSENT_PHRASES))
}

pub const IMAGES_PRESENT: &str = r#"!!document.querySelector('img, picture, svg, object[data], [style*="background"]')"#;

pub const DOCUMENT_HEIGHT: &str =
    "Math.max(document.body ? document.body.scrollHeight : 0, document.documentElement.scrollHeight)";

pub const SCROLL_TO_BOTTOM: &str =
    "window.scrollTo(0, Math.max(document.body ? document.body.scrollHeight : 0, document.documentElement.scrollHeight))";

pub const SCROLL_TO_TOP: &str = "window.scrollTo(0, 0)";

/// Resolves once `document.readyState` is complete and the resource count has
/// been stable for a second, or after `timeout_ms`.
pub fn network_idle_script(timeout_ms: u64) -> String {
    format!(
        r#"(async () => {{
  const start = Date.now();
  let last = performance.getEntriesByType('resource').length;
  let stable = 0;
  while (Date.now() - start < {timeout_ms}) {{
    await new Promise(r => setTimeout(r, 250));
    const current = performance.getEntriesByType('resource').length;
    if (document.readyState === 'complete' && current === last) {{
      stable += 250;
      if (stable >= 1000) return true;
    }} else {{
      stable = 0;
    }}
    last = current;
  }}
  return false;
}})()"#
    )
}

const EXTRACT_TEMPLATE: &str = r#"(() => {
  const lazyAttrs = __LAZY__;
  const seen = new Set();
  const images = [];
  const abs = (raw) => {
    if (!raw) return null;
    const value = String(raw).trim();
    if (!value || value.startsWith('data:') || value.startsWith('javascript:')) return null;
    try { return new URL(value, document.baseURI).href; } catch (_) { return null; }
  };
  // Icon candidates are classified later, so they must not claim a URL here.
  const push = (entry) => {
    if (entry.url && entry.kind !== 'icon') {
      if (seen.has(entry.url)) return;
      seen.add(entry.url);
    }
    images.push(entry);
  };
  const lastCandidate = (srcset) => {
    const parts = srcset.split(',').map(s => s.trim()).filter(Boolean);
    return parts.length ? parts[parts.length - 1].split(/\s+/)[0] : null;
  };

  for (const img of document.querySelectorAll('img')) {
    let src = img.currentSrc || img.getAttribute('src');
    if (!src) src = lazyAttrs.map(a => img.getAttribute(a)).find(Boolean);
    if (src && src.includes(',') && /\s\d+[wx]/.test(src)) src = lastCandidate(src);
    if (!src && img.getAttribute('srcset')) src = lastCandidate(img.getAttribute('srcset'));
    const url = abs(src);
    if (url) push({ kind: 'img', url, alt: img.getAttribute('alt') });
  }

  const urlPattern = /url\(\s*['"]?([^'")]+?)['"]?\s*\)/gi;
  const backgrounds = (value) => {
    if (!value || value === 'none') return;
    for (const m of value.matchAll(urlPattern)) {
      const url = abs(m[1]);
      if (url) push({ kind: 'background', url });
    }
  };
  for (const el of document.querySelectorAll('*')) {
    backgrounds(getComputedStyle(el).backgroundImage);
    backgrounds(getComputedStyle(el, '::before').backgroundImage);
    backgrounds(getComputedStyle(el, '::after').backgroundImage);
  }

  for (const svg of document.querySelectorAll('svg')) {
    if (svg.parentElement && svg.parentElement.closest('svg')) continue;
    push({ kind: 'svg', content: svg.outerHTML, width: svg.getAttribute('width'), height: svg.getAttribute('height') });
  }

  for (const obj of document.querySelectorAll('object[data]')) {
    const type = (obj.getAttribute('type') || '').toLowerCase();
    const url = abs(obj.getAttribute('data'));
    if (url && (type.startsWith('image/') || /\.(png|jpe?g|gif|svg|webp|bmp|ico|avif|tiff?)(\?|#|$)/i.test(url))) {
      push({ kind: 'object', url, mime: type || null });
    }
  }

  for (const link of document.querySelectorAll('link[rel][href]')) {
    const url = abs(link.getAttribute('href'));
    if (url) push({ kind: 'icon', url, rel: link.getAttribute('rel'), sizes: link.getAttribute('sizes') });
  }
  for (const meta of document.querySelectorAll('meta[content]')) {
    const key = meta.getAttribute('property') || meta.getAttribute('name');
    if (!key) continue;
    const lower = key.toLowerCase();
    if (!(['og:image', 'og:image:url', 'og:image:secure_url', 'twitter:image', 'twitter:image:src'].includes(lower) || lower.startsWith('msapplication-'))) continue;
    const url = abs(meta.getAttribute('content'));
    if (url) push({ kind: 'icon', url, rel: key, sizes: null });
  }

  return { head: document.head ? document.head.innerHTML : '', images };
})()"#;

/// Single-pass collection of every image the rendered page references.
pub fn extract_script() -> String {
    EXTRACT_TEMPLATE.replace("__LAZY__", &js_value(LAZY_ATTRIBUTES))
}
