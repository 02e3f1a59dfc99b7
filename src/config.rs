use crate::finalize::VariantSpec;
use crate::indexer::MetadataStoreConfig;
use std::{env, path::PathBuf, time::Duration};

pub const DEFAULT_STRUCTURED_SEARCH_URL: &str = "https://www.bing.com/images/search";
pub const DEFAULT_INLINE_SEARCH_URL: &str = "https://www.google.com/search";
pub const DEFAULT_SCRAPER_VERSION: &str = "v0.1-sidecars";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub output_dir: PathBuf,
    pub structured_search_url: String,
    pub inline_search_url: String,
    pub search_timeout: Duration,
    pub download_timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    pub max_candidates: usize,
    pub min_image_bytes: usize,
    pub min_image_edge: u32,
    pub scraper_version: String,
    pub perceptual_hash: bool,
    pub variants: Vec<VariantSpec>,
    pub metadata_store: Option<MetadataStoreConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            structured_search_url: DEFAULT_STRUCTURED_SEARCH_URL.to_string(),
            inline_search_url: DEFAULT_INLINE_SEARCH_URL.to_string(),
            search_timeout: Duration::from_secs(15),
            download_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(5),
            user_agent: "Mozilla/5.0".to_string(),
            max_candidates: 20,
            min_image_bytes: 20_000,
            min_image_edge: 400,
            scraper_version: DEFAULT_SCRAPER_VERSION.to_string(),
            perceptual_hash: true,
            variants: VariantSpec::defaults(),
            metadata_store: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            output_dir: env::var("OUTPUT_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            structured_search_url: env_string("STRUCTURED_SEARCH_URL")
                .unwrap_or(defaults.structured_search_url),
            inline_search_url: env_string("INLINE_SEARCH_URL")
                .unwrap_or(defaults.inline_search_url),
            search_timeout: env_secs("SEARCH_TIMEOUT_SECS").unwrap_or(defaults.search_timeout),
            download_timeout: env_secs("DOWNLOAD_TIMEOUT_SECS")
                .unwrap_or(defaults.download_timeout),
            connect_timeout: env_secs("HTTP_CONNECT_TIMEOUT_SECS")
                .unwrap_or(defaults.connect_timeout),
            user_agent: env_string("USER_AGENT").unwrap_or(defaults.user_agent),
            max_candidates: env_parse::<usize>("MAX_CANDIDATES")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_candidates),
            min_image_bytes: env_parse("MIN_IMAGE_BYTES").unwrap_or(defaults.min_image_bytes),
            min_image_edge: env_parse("MIN_IMAGE_EDGE").unwrap_or(defaults.min_image_edge),
            scraper_version: env_string("SCRAPER_VERSION").unwrap_or(defaults.scraper_version),
            perceptual_hash: env::var("PHASH_ENABLED")
                .map(|_| parse_env_bool("PHASH_ENABLED"))
                .unwrap_or(defaults.perceptual_hash),
            variants: env_string("VARIANTS")
                .map(|raw| VariantSpec::parse_list(&raw))
                .filter(|list| !list.is_empty())
                .unwrap_or(defaults.variants),
            metadata_store: MetadataStoreConfig::from_env(),
        }
    }
}

pub fn parse_env_bool(key: &str) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

pub(crate) fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key)
        .filter(|v| *v > 0)
        .map(Duration::from_secs)
}
