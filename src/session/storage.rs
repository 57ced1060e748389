use serde::{Deserialize, Serialize};

/// Persisted session state: cookies plus per-origin localStorage.
///
/// The field names are the on-disk contract and must not change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageState {
    pub cookies: Vec<Cookie>,
    pub origins: Vec<OriginState>,
}

/// One cookie, in the debugger's camelCase shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
}

/// localStorage for one origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginState {
    pub origin: String,
    #[serde(rename = "localStorage")]
    pub local_storage: Vec<StorageItem>,
}

/// One localStorage entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageItem {
    pub name: String,
    pub value: String,
}

/// Deduplicate cookies by (name, domain, path); first occurrence wins.
#[must_use]
pub fn dedup_cookies(cookies: Vec<Cookie>) -> Vec<Cookie> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(cookies.len());
    for cookie in cookies {
        let key = (
            cookie.name.clone(),
            cookie.domain.clone(),
            cookie.path.clone(),
        );
        if seen.insert(key) {
            out.push(cookie);
        }
    }
    out
}

/// Deduplicate origin entries by origin; first occurrence wins.
#[must_use]
pub fn dedup_origins(origins: Vec<OriginState>) -> Vec<OriginState> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(origins.len());
    for origin in origins {
        if seen.insert(origin.origin.clone()) {
            out.push(origin);
        }
    }
    out
}

/// Whether a page URL is eligible for localStorage capture. The null page
/// and non-web schemes have no meaningful origin.
#[must_use]
pub fn has_web_origin(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Parse a debugger cookie object into [`Cookie`].
#[must_use]
pub fn cookie_from_value(value: &serde_json::Value) -> Option<Cookie> {
    Some(Cookie {
        name: value["name"].as_str()?.to_owned(),
        value: value["value"].as_str().unwrap_or_default().to_owned(),
        domain: value["domain"].as_str().unwrap_or_default().to_owned(),
        path: value["path"].as_str().unwrap_or("/").to_owned(),
        expires: value["expires"].as_f64(),
        http_only: value["httpOnly"].as_bool(),
        secure: value["secure"].as_bool(),
    })
}
