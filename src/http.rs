use crate::config::PipelineConfig;
use reqwest::Client;

/// Shared client for search pages, image downloads, and the metadata store.
/// Per-request timeouts are applied by the callers.
pub fn build_client(config: &PipelineConfig) -> Client {
    Client::builder()
        .user_agent(config.user_agent.clone())
        .connect_timeout(config.connect_timeout)
        .timeout(config.download_timeout.max(config.search_timeout))
        .build()
        .unwrap_or_else(|_| Client::new())
}
