//! Product catalog lookup.
//! Maps a manufacturer product id to the capabilities and display metadata of its model.

use crate::error::{CozyError, Result};
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Host serving the product catalog.
pub const DEFAULT_CATALOG_URL: &str = "http://api-us.doiting.com";
/// Path of the product model listing.
pub const CATALOG_PATH: &str = "/api/v2/device_product/model";
/// Languages the catalog service understands.
pub const SUPPORTED_LANGUAGES: &[&str] = &["zh", "en", "es", "pt", "ja", "ru", "nl", "ko", "fr", "de"];
/// Used when the requested language is not in [`SUPPORTED_LANGUAGES`].
pub const DEFAULT_LANGUAGE: &str = "en";

const CATALOG_TIMEOUT: Duration = Duration::from_secs(3);
const RET_OK: &str = "1";

/// Device category as reported by the catalog (`device_type_code`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(from = "String")]
pub enum TypeCode {
    /// Relay / plug (`"00"`).
    Switch,
    /// Dimmable or color light (`"01"`).
    Light,
    /// A category this crate has no special handling for.
    Other(String),
    /// No catalog entry matched the device.
    #[default]
    Unknown,
}

impl TypeCode {
    pub const SWITCH_CODE: &'static str = "00";
    pub const LIGHT_CODE: &'static str = "01";

    pub fn from_code(code: &str) -> Self {
        match code {
            Self::SWITCH_CODE => TypeCode::Switch,
            Self::LIGHT_CODE => TypeCode::Light,
            "" => TypeCode::Unknown,
            other => TypeCode::Other(other.to_string()),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            TypeCode::Switch => Self::SWITCH_CODE,
            TypeCode::Light => Self::LIGHT_CODE,
            TypeCode::Other(code) => code,
            TypeCode::Unknown => "",
        }
    }
}

impl From<String> for TypeCode {
    fn from(code: String) -> Self {
        Self::from_code(&code)
    }
}

/// One product model inside a catalog category.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProductModel {
    #[serde(rename = "device_product_id")]
    pub product_id: String,
    #[serde(default)]
    pub icon: String,
    #[serde(rename = "device_model_name", default)]
    pub model_name: String,
    #[serde(default, deserialize_with = "dpid_set")]
    pub dpid: BTreeSet<u32>,
}

/// A device category and the product models belonging to it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CategoryEntry {
    #[serde(rename = "device_type_code", deserialize_with = "type_code")]
    pub type_code: TypeCode,
    #[serde(rename = "device_model", default, deserialize_with = "model_list")]
    pub models: Vec<ProductModel>,
}

/// Resolved capabilities of one device model.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapabilityProfile {
    pub type_code: TypeCode,
    pub model_name: String,
    pub icon: String,
    pub supported_data_points: BTreeSet<u32>,
}

impl CapabilityProfile {
    /// Profile of a device whose product id is not in the catalog.
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_known(&self) -> bool {
        self.type_code != TypeCode::Unknown
    }

    pub fn supports(&self, dpid: u32) -> bool {
        self.supported_data_points.contains(&dpid)
    }
}

/// Find the profile for `product_id` among catalog entries.
pub fn resolve(entries: &[CategoryEntry], product_id: &str) -> Option<CapabilityProfile> {
    entries.iter().find_map(|entry| {
        entry
            .models
            .iter()
            .find(|m| m.product_id == product_id)
            .map(|m| CapabilityProfile {
                type_code: entry.type_code.clone(),
                model_name: m.model_name.clone(),
                icon: m.icon.clone(),
                supported_data_points: m.dpid.clone(),
            })
    })
}

/// Map a requested language onto one the catalog service supports.
pub fn normalize_language(language: &str) -> &'static str {
    let lang = language.trim().to_ascii_lowercase();
    SUPPORTED_LANGUAGES
        .iter()
        .find(|l| **l == lang)
        .copied()
        .unwrap_or(DEFAULT_LANGUAGE)
}

/// Validate a catalog response body and extract its category list.
///
/// The body must look like `{"ret": "1", "info": {"list": [...]}}`. Entries that
/// do not deserialize are skipped.
pub fn parse_catalog(body: &Value) -> Result<Vec<CategoryEntry>> {
    if body.get("ret").and_then(Value::as_str) != Some(RET_OK) {
        return Err(CozyError::InvalidPayload);
    }
    let list = body
        .get("info")
        .filter(|info| info.is_object())
        .and_then(|info| info.get("list"))
        .and_then(Value::as_array)
        .ok_or(CozyError::InvalidPayload)?;

    Ok(list
        .iter()
        .filter_map(|item| match CategoryEntry::deserialize(item) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("Skipping malformed catalog entry: {}", e);
                None
            }
        })
        .collect())
}

/// Type codes arrive as `"01"`, occasionally as the bare number `1`.
fn type_code<'de, D>(deserializer: D) -> std::result::Result<TypeCode, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(code) => Ok(TypeCode::from_code(&code)),
        Value::Number(n) => n
            .as_u64()
            .map(|n| TypeCode::from_code(&format!("{:02}", n)))
            .ok_or_else(|| D::Error::custom(format!("invalid device_type_code {}", n))),
        other => Err(D::Error::custom(format!(
            "invalid device_type_code {}",
            other
        ))),
    }
}

/// Models that do not deserialize are dropped without affecting their siblings.
fn model_list<'de, D>(deserializer: D) -> std::result::Result<Vec<ProductModel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|item| match ProductModel::deserialize(item) {
            Ok(model) => Some(model),
            Err(e) => {
                debug!("Skipping malformed product model: {}", e);
                None
            }
        })
        .collect())
}

fn dpid_set<'de, D>(deserializer: D) -> std::result::Result<BTreeSet<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .iter()
        .filter_map(|v| {
            v.as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        })
        .collect())
}

/// Process-lifetime cache in front of the remote product catalog.
///
/// The first successful, non-empty fetch is kept forever and returned to every later
/// caller whatever language they ask for. Failed fetches leave the cache empty so the
/// next call tries again. Two callers missing the cache at once may both fetch; the
/// first result stored wins.
pub struct Catalog {
    base_url: String,
    client: reqwest::Client,
    cache: RwLock<Option<Arc<Vec<CategoryEntry>>>>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    /// Catalog backed by the public product service.
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_CATALOG_URL)
    }

    /// Catalog backed by a custom host, e.g. a local mirror.
    pub fn with_base_url<U: Into<String>>(base_url: U) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            cache: RwLock::new(None),
        }
    }

    /// Catalog that is already populated and never touches the network.
    pub fn from_entries(entries: Vec<CategoryEntry>) -> Self {
        let catalog = Self::new();
        *catalog.cache.write() = Some(Arc::new(entries));
        catalog
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Cached entries, if a fetch has succeeded.
    pub fn cached(&self) -> Option<Arc<Vec<CategoryEntry>>> {
        self.cache.read().clone()
    }

    /// Return the cached list, fetching it in `language` on first use.
    ///
    /// Never fails: an unreachable or malformed catalog yields an empty list.
    pub async fn get_or_fetch(&self, language: &str) -> Arc<Vec<CategoryEntry>> {
        if let Some(entries) = self.cached() {
            return entries;
        }

        let lang = normalize_language(language);
        match self.fetch(lang).await {
            Ok(entries) if !entries.is_empty() => {
                let mut guard = self.cache.write();
                let cached = guard.get_or_insert_with(|| Arc::new(entries));
                info!("Product catalog loaded ({} categories)", cached.len());
                cached.clone()
            }
            Ok(_) => {
                warn!("Product catalog is empty, will retry on next lookup");
                Arc::new(Vec::new())
            }
            Err(e) => {
                warn!("Product catalog unavailable: {}", e);
                Arc::new(Vec::new())
            }
        }
    }

    /// Resolve `product_id`, fetching the catalog first if needed.
    pub async fn profile_for(&self, product_id: &str, language: &str) -> Option<CapabilityProfile> {
        let entries = self.get_or_fetch(language).await;
        resolve(&entries, product_id)
    }

    async fn fetch(&self, language: &str) -> Result<Vec<CategoryEntry>> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), CATALOG_PATH);
        debug!("Fetching product catalog from {} (lang={})", url, language);

        let resp = self
            .client
            .get(&url)
            .query(&[("lang", language)])
            .timeout(CATALOG_TIMEOUT)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CozyError::Http(format!("unexpected status {}", status)));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| CozyError::Json(e.to_string()))?;
        parse_catalog(&body)
    }
}
