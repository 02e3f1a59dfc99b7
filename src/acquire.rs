use crate::config::PipelineConfig;
use crate::metrics;
use crate::models::{Candidate, Entry};
use crate::sidecar::{SidecarBuilder, SidecarInput};
use reqwest::Client;
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const MAX_STEM_CHARS: usize = 120;

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("payload too small ({bytes} bytes)")]
    TooSmall { bytes: usize },
    #[error("undecodable image: {0}")]
    Undecodable(String),
    #[error("dimensions too small ({width}x{height})")]
    Undersized { width: u32, height: u32 },
    #[error("staging write failed: {0}")]
    Io(#[from] std::io::Error),
}

impl AcquireError {
    fn reason(&self) -> &'static str {
        match self {
            AcquireError::Request(_) => "request",
            AcquireError::Status(_) => "status",
            AcquireError::TooSmall { .. } => "byte_gate",
            AcquireError::Undecodable(_) => "undecodable",
            AcquireError::Undersized { .. } => "dimension_gate",
            AcquireError::Io(_) => "io",
        }
    }
}

/// An image written to staging. `sidecar` is `None` only when the sidecar write failed.
#[derive(Debug, Clone, Serialize)]
pub struct StagedImage {
    pub path: PathBuf,
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub filesize: usize,
    pub sidecar: Option<PathBuf>,
}

pub fn check_byte_size(len: usize, min_bytes: usize) -> Result<(), AcquireError> {
    if len < min_bytes {
        Err(AcquireError::TooSmall { bytes: len })
    } else {
        Ok(())
    }
}

pub fn check_dimensions(width: u32, height: u32, min_edge: u32) -> Result<(), AcquireError> {
    if width < min_edge || height < min_edge {
        Err(AcquireError::Undersized { width, height })
    } else {
        Ok(())
    }
}

/// Collapses every run of characters outside `[A-Za-z0-9._-]` into `_`.
pub fn safe_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_run = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    let trimmed: String = out
        .trim_matches(|c| matches!(c, '.' | '_' | '-'))
        .chars()
        .take(MAX_STEM_CHARS)
        .collect();
    if trimmed.is_empty() {
        "img".to_string()
    } else {
        trimmed
    }
}

/// The index goes on after truncation so long names still stay unique per candidate.
pub fn staging_stem(manufacturer: &str, part_number: &str, index: usize) -> String {
    format!("{}_{index}", safe_name(&format!("{manufacturer}_{part_number}")))
}

/// Decode, gate, write and describe one downloaded image, off the async workers.
struct StageJob {
    bytes: Vec<u8>,
    path: PathBuf,
    url: String,
    entry: Entry,
    min_edge: u32,
    sidecars: SidecarBuilder,
}

impl StageJob {
    fn run(self) -> Result<StagedImage, AcquireError> {
        let image = image::load_from_memory(&self.bytes)
            .map_err(|err| AcquireError::Undecodable(err.to_string()))?;
        check_dimensions(image.width(), image.height(), self.min_edge)?;

        std::fs::write(&self.path, &self.bytes)?;
        metrics::image_accepted(self.bytes.len());
        info!(target = "imagery.acquire", path = %self.path.display(), url = %self.url, "image_staged");

        let sidecar = match self.sidecars.build_and_write(&SidecarInput {
            image_path: &self.path,
            bytes: &self.bytes,
            image: &image,
            format: image::guess_format(&self.bytes).ok(),
            manufacturer: &self.entry.manufacturer,
            sku: self.entry.product_key(),
            description: self.entry.description.as_deref(),
            image_url: Some(&self.url),
            page_url: None,
            referer: None,
        }) {
            Ok(sidecar) => Some(sidecar),
            Err(err) => {
                error!(
                    target = "imagery.sidecar",
                    path = %self.path.display(),
                    error = %err,
                    "sidecar_write_failed"
                );
                None
            }
        };

        Ok(StagedImage {
            width: image.width(),
            height: image.height(),
            filesize: self.bytes.len(),
            path: self.path,
            url: self.url,
            sidecar,
        })
    }
}

#[derive(Clone)]
pub struct CandidateAcquirer {
    http: Client,
    timeout: Duration,
    min_bytes: usize,
    min_edge: u32,
    sidecars: SidecarBuilder,
}

impl CandidateAcquirer {
    pub fn new(http: Client, config: &PipelineConfig, sidecars: SidecarBuilder) -> Self {
        Self {
            http,
            timeout: config.download_timeout,
            min_bytes: config.min_image_bytes,
            min_edge: config.min_image_edge,
            sidecars,
        }
    }

    /// Downloads candidates one at a time. Any per-candidate failure is logged and skipped.
    pub async fn acquire(
        &self,
        candidates: &[Candidate],
        entry: &Entry,
        staging_dir: &Path,
    ) -> Vec<StagedImage> {
        if let Err(err) = tokio::fs::create_dir_all(staging_dir).await {
            error!(target = "imagery.acquire", dir = %staging_dir.display(), error = %err, "staging_unavailable");
            return Vec::new();
        }

        let mut staged = Vec::new();
        for (index, candidate) in candidates.iter().enumerate() {
            debug!(
                target = "imagery.acquire",
                position = index + 1,
                total = candidates.len(),
                url = %candidate.url,
                "downloading"
            );
            match self.acquire_one(index, candidate, entry, staging_dir).await {
                Ok(image) => staged.push(image),
                Err(err) => {
                    metrics::candidate_rejected(err.reason());
                    warn!(
                        target = "imagery.acquire",
                        url = %candidate.url,
                        error = %err,
                        "candidate_skipped"
                    );
                }
            }
        }
        info!(
            target = "imagery.acquire",
            sku = %entry.sku_id,
            accepted = staged.len(),
            offered = candidates.len(),
            "acquisition_finished"
        );
        staged
    }

    async fn acquire_one(
        &self,
        index: usize,
        candidate: &Candidate,
        entry: &Entry,
        staging_dir: &Path,
    ) -> Result<StagedImage, AcquireError> {
        let bytes = self.download(&candidate.url).await?;
        check_byte_size(bytes.len(), self.min_bytes)?;

        let stem = staging_stem(&entry.manufacturer, entry.product_key(), index);
        let path = staging_dir.join(format!("{stem}.jpg"));
        let job = StageJob {
            bytes,
            path,
            url: candidate.url.clone(),
            entry: entry.clone(),
            min_edge: self.min_edge,
            sidecars: self.sidecars.clone(),
        };
        tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|err| AcquireError::Io(std::io::Error::other(err)))?
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, AcquireError> {
        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| AcquireError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(AcquireError::Status(response.status().as_u16()));
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| AcquireError::Request(err.to_string()))?;
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sidecar::{sha256_hex, sidecar_path};
    use crate::testing::{FakeWeb, flat_png, noise_png};
    use serde_json::Value;
    use std::fs;

    fn entry() -> Entry {
        Entry {
            manufacturer: "Acme".into(),
            part_number: Some("PN-1".into()),
            description: Some("Bearing".into()),
            sku_id: "1001".into(),
        }
    }

    fn candidate(url: String) -> Candidate {
        Candidate {
            host: crate::search::authority(&url).unwrap_or_default(),
            url,
        }
    }

    #[test]
    fn byte_gate_boundary() {
        assert!(matches!(
            check_byte_size(19_999, 20_000),
            Err(AcquireError::TooSmall { bytes: 19_999 })
        ));
        assert!(check_byte_size(20_000, 20_000).is_ok());
    }

    #[test]
    fn dimension_gate_boundary() {
        assert!(matches!(
            check_dimensions(399, 1000, 400),
            Err(AcquireError::Undersized { width: 399, height: 1000 })
        ));
        assert!(check_dimensions(1000, 399, 400).is_err());
        assert!(check_dimensions(400, 400, 400).is_ok());
    }

    #[test]
    fn stems_are_filesystem_safe() {
        assert_eq!(staging_stem("Acme", "PN-1", 0), "Acme_PN-1_0");
        assert_eq!(staging_stem("A/B Corp.", "12 34\\x", 3), "A_B_Corp._12_34_x_3");
        assert_eq!(safe_name("///"), "img");
        assert_eq!(safe_name(&"x".repeat(300)).len(), MAX_STEM_CHARS);
    }

    #[tokio::test]
    async fn acquisition_applies_gates_and_writes_sidecars() {
        let web = FakeWeb::start().await;
        let photo = noise_png(800, 800);
        web.serve("/p1.png", photo.clone());
        web.serve("/flat.png", flat_png(800, 800));
        web.serve("/narrow.png", noise_png(399, 1000));
        web.serve("/junk.bin", vec![7u8; 30_000]);

        let candidates = vec![
            candidate(web.url("/p1.png")),
            candidate(web.url("/missing.png")),
            candidate(web.url("/flat.png")),
            candidate(web.url("/narrow.png")),
            candidate(web.url("/junk.bin")),
        ];
        let staging = tempfile::tempdir().expect("tempdir");
        let config = web.config();
        let acquirer = CandidateAcquirer::new(
            Client::new(),
            &config,
            SidecarBuilder::from_flag("v0.1-sidecars", true),
        );

        let staged = acquirer.acquire(&candidates, &entry(), staging.path()).await;
        assert_eq!(staged.len(), 1);
        let image = &staged[0];
        assert_eq!(image.path, staging.path().join("Acme_PN-1_0.jpg"));
        assert_eq!((image.width, image.height), (800, 800));
        assert_eq!(image.url, web.url("/p1.png"));

        let on_disk = fs::read(&image.path).expect("staged bytes");
        assert_eq!(on_disk, photo);
        let sidecar: Value =
            serde_json::from_slice(&fs::read(sidecar_path(&image.path)).expect("sidecar"))
                .expect("json");
        assert_eq!(sidecar["image"]["sha256"], Value::String(sha256_hex(&on_disk)));
        assert_eq!(sidecar["image"]["width"], 800);
        assert_eq!(sidecar["product"]["description"], "Bearing");

        let files = fs::read_dir(staging.path()).expect("read staging").count();
        assert_eq!(files, 2);
    }

    #[test]
    fn long_names_keep_distinct_stems() {
        let part = "P".repeat(130);
        let first = staging_stem("Acme", &part, 0);
        let second = staging_stem("Acme", &part, 1);
        assert_ne!(first, second);
        assert!(first.ends_with("_0") && second.ends_with("_1"));
    }

    #[tokio::test]
    async fn long_part_numbers_do_not_overwrite_each_other() {
        let web = FakeWeb::start().await;
        web.serve("/a.png", noise_png(420, 420));
        web.serve("/b.png", noise_png(440, 440));
        let candidates = vec![candidate(web.url("/a.png")), candidate(web.url("/b.png"))];
        let staging = tempfile::tempdir().expect("tempdir");
        let acquirer = CandidateAcquirer::new(
            Client::new(),
            &web.config(),
            SidecarBuilder::from_flag("v", false),
        );
        let long = Entry {
            part_number: Some("P".repeat(130)),
            ..entry()
        };

        let staged = acquirer.acquire(&candidates, &long, staging.path()).await;
        assert_eq!(staged.len(), 2);
        assert_ne!(staged[0].path, staged[1].path);
        assert_eq!(fs::read_dir(staging.path()).expect("read").count(), 4);
    }

    #[tokio::test]
    async fn sidecar_failure_keeps_the_image_staged() {
        let web = FakeWeb::start().await;
        web.serve("/p1.png", noise_png(500, 500));
        let staging = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(staging.path().join("Acme_PN-1_0.jpg.json")).expect("blocking directory");
        let acquirer = CandidateAcquirer::new(
            Client::new(),
            &web.config(),
            SidecarBuilder::from_flag("v", false),
        );

        let staged = acquirer
            .acquire(&[candidate(web.url("/p1.png"))], &entry(), staging.path())
            .await;
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].sidecar, None);
        assert!(staging.path().join("Acme_PN-1_0.jpg").is_file());
    }

    #[tokio::test]
    async fn every_staged_image_has_a_sidecar() {
        let web = FakeWeb::start().await;
        web.serve("/a.png", noise_png(420, 420));
        web.serve("/b.png", noise_png(500, 640));
        let candidates = vec![candidate(web.url("/a.png")), candidate(web.url("/b.png"))];
        let staging = tempfile::tempdir().expect("tempdir");
        let acquirer = CandidateAcquirer::new(
            Client::new(),
            &web.config(),
            SidecarBuilder::from_flag("v", false),
        );
        acquirer.acquire(&candidates, &entry(), staging.path()).await;

        let images: Vec<PathBuf> = fs::read_dir(staging.path())
            .expect("read")
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "jpg"))
            .collect();
        assert_eq!(images.len(), 2);
        for image in images {
            assert!(sidecar_path(&image).exists(), "missing sidecar for {}", image.display());
        }
    }
}
