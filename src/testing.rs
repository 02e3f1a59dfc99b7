use crate::config::PipelineConfig;
use crate::indexer::MetadataStoreConfig;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use image::{DynamicImage, ImageFormat, RgbImage};
use serde_json::{Value, json};
use std::{
    collections::HashMap,
    io::Cursor,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

#[derive(Default)]
struct FakeState {
    structured: Mutex<Vec<(String, String)>>,
    inline: Mutex<Vec<(String, String)>>,
    structured_fails: AtomicBool,
    store_fails: AtomicBool,
    assets: Mutex<HashMap<String, Vec<u8>>>,
    structured_queries: Mutex<Vec<String>>,
    inline_queries: Mutex<Vec<String>>,
    fetched: Mutex<Vec<String>>,
    indexed: Mutex<Vec<Value>>,
}

pub struct FakeWeb {
    base: String,
    authority: String,
    state: Arc<FakeState>,
}

impl FakeWeb {
    pub async fn start() -> Self {
        let state = Arc::new(FakeState::default());
        let app = Router::new()
            .route("/bing/images/search", get(structured_search))
            .route("/google/search", get(inline_search))
            .route("/assets/{*path}", get(asset))
            .route("/store/{index}/_doc", post(store_document))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake web");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            base: format!("http://{addr}"),
            authority: addr.to_string(),
            state,
        }
    }

    /// `host:port` of the fake server, as candidate filtering sees it.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn url(&self, asset_path: &str) -> String {
        format!("{}/assets{}", self.base, asset_path)
    }

    pub fn config(&self) -> PipelineConfig {
        PipelineConfig {
            structured_search_url: format!("{}/bing/images/search", self.base),
            inline_search_url: format!("{}/google/search", self.base),
            search_timeout: Duration::from_secs(5),
            download_timeout: Duration::from_secs(5),
            metadata_store: None,
            ..PipelineConfig::default()
        }
    }

    pub fn store_config(&self) -> MetadataStoreConfig {
        MetadataStoreConfig {
            base_url: format!("{}/store", self.base),
            index: "image_metadata".into(),
            username: None,
            password: None,
        }
    }

    pub fn serve(&self, asset_path: &str, bytes: Vec<u8>) {
        lock(&self.state.assets).insert(asset_path.trim_start_matches('/').to_string(), bytes);
    }

    /// Structured backend returns `html` for any query containing `needle`.
    pub fn structured_rule(&self, needle: &str, html: String) {
        lock(&self.state.structured).push((needle.to_string(), html));
    }

    pub fn inline_rule(&self, needle: &str, html: String) {
        lock(&self.state.inline).push((needle.to_string(), html));
    }

    pub fn fail_structured(&self) {
        self.state.structured_fails.store(true, Ordering::SeqCst);
    }

    pub fn fail_store(&self) {
        self.state.store_fails.store(true, Ordering::SeqCst);
    }

    pub fn structured_queries(&self) -> Vec<String> {
        lock(&self.state.structured_queries).clone()
    }

    pub fn inline_queries(&self) -> Vec<String> {
        lock(&self.state.inline_queries).clone()
    }

    pub fn fetched(&self) -> Vec<String> {
        lock(&self.state.fetched).clone()
    }

    pub fn indexed(&self) -> Vec<Value> {
        lock(&self.state.indexed).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn answer(rules: &Mutex<Vec<(String, String)>>, query: &str) -> String {
    lock(rules)
        .iter()
        .find(|(needle, _)| query.contains(needle.as_str()))
        .map(|(_, html)| html.clone())
        .unwrap_or_else(|| "<html><body>no results</body></html>".to_string())
}

async fn structured_search(
    State(state): State<Arc<FakeState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let query = params.get("q").cloned().unwrap_or_default();
    lock(&state.structured_queries).push(query.clone());
    if state.structured_fails.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    answer(&state.structured, &query).into_response()
}

async fn inline_search(
    State(state): State<Arc<FakeState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let query = params.get("q").cloned().unwrap_or_default();
    lock(&state.inline_queries).push(query.clone());
    answer(&state.inline, &query).into_response()
}

async fn asset(State(state): State<Arc<FakeState>>, Path(path): Path<String>) -> Response {
    lock(&state.fetched).push(path.clone());
    match lock(&state.assets).get(&path).cloned() {
        Some(bytes) => bytes.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn store_document(
    State(state): State<Arc<FakeState>>,
    Path(_index): Path<String>,
    Json(doc): Json<Value>,
) -> Response {
    if state.store_fails.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let mut indexed = lock(&state.indexed);
    indexed.push(doc);
    let id = format!("doc-{}", indexed.len());
    (StatusCode::CREATED, Json(json!({ "_id": id, "result": "created" }))).into_response()
}

pub fn structured_page(urls: &[String]) -> String {
    let anchors: String = urls
        .iter()
        .map(|url| {
            format!(
                "<a class=\"iusc\" m=\"{{&quot;murl&quot;:&quot;{url}&quot;,&quot;turl&quot;:&quot;https://tse1.mm.bing.net/th?id=x&quot;}}\"></a>"
            )
        })
        .collect();
    format!("<html><body>{anchors}</body></html>")
}

pub fn inline_page(urls: &[String]) -> String {
    let images: String = urls
        .iter()
        .map(|url| format!("<img src=\"{url}\">"))
        .collect();
    format!("<html><body>{images}</body></html>")
}

/// PNG of pseudo-random pixels; noise defeats compression so the payload stays large.
pub fn noise_png(width: u32, height: u32) -> Vec<u8> {
    let mut seed: u32 = 0x9E37_79B9 ^ width.wrapping_mul(31) ^ height;
    let image = RgbImage::from_fn(width, height, |_, _| {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        let [r, g, b, _] = seed.to_le_bytes();
        image::Rgb([r, g, b])
    });
    encode_png(DynamicImage::ImageRgb8(image))
}

/// Single-colour PNG; compresses to a few hundred bytes.
pub fn flat_png(width: u32, height: u32) -> Vec<u8> {
    encode_png(DynamicImage::ImageRgb8(RgbImage::from_pixel(
        width,
        height,
        image::Rgb([200, 200, 200]),
    )))
}

fn encode_png(image: DynamicImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("encode png");
    bytes
}
