use chrono::Utc;
use image::{DynamicImage, ImageFormat, imageops::FilterType};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("image path has no file name: {0}")]
    NoFileName(String),
    #[error("serialize failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sidecar {
    pub image: ImageSection,
    pub product: ProductSection,
    pub source: SourceSection,
    pub ml: MlSection,
    pub pipeline: PipelineSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSection {
    pub filename: String,
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub filesize: u64,
    pub sha256: String,
    pub phash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSection {
    pub manufacturer: String,
    pub sku: String,
    pub description: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSection {
    pub image_url: Option<String>,
    pub page_url: Option<String>,
    pub referer: Option<String>,
    pub license_hint: Option<String>,
    pub found_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlSection {
    pub garbage: GarbageLabel,
}

/// Classifier verdict slot; filled in later by the labeling loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GarbageLabel {
    pub label: String,
    pub score: Option<f64>,
    pub reason: Option<String>,
    pub model: Option<String>,
    pub model_version: Option<String>,
    pub pos_sim: Option<f64>,
    pub neg_sim: Option<f64>,
    pub margin: Option<f64>,
    pub tagged_at: Option<String>,
}

impl GarbageLabel {
    pub fn pending() -> Self {
        Self {
            label: "pending".into(),
            score: None,
            reason: None,
            model: None,
            model_version: None,
            pos_sim: None,
            neg_sim: None,
            margin: None,
            tagged_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSection {
    pub scraper_version: String,
    pub notes: Vec<String>,
}

pub trait PerceptualHasher: Send + Sync {
    fn hash(&self, image: &DynamicImage) -> Option<String>;
}

/// 64-bit DCT hash: 32×32 grayscale, 2-D DCT-II, low 8×8 block against its median.
#[derive(Debug, Default, Clone, Copy)]
pub struct DctPerceptualHasher;

impl PerceptualHasher for DctPerceptualHasher {
    fn hash(&self, image: &DynamicImage) -> Option<String> {
        const SIDE: usize = 32;
        const LOW: usize = 8;

        let gray = image
            .grayscale()
            .resize_exact(SIDE as u32, SIDE as u32, FilterType::Lanczos3)
            .to_luma8();
        let pixels: Vec<f64> = gray.pixels().map(|p| f64::from(p.0[0])).collect();
        if pixels.len() != SIDE * SIDE {
            return None;
        }

        let rows: Vec<f64> = pixels.chunks(SIDE).flat_map(dct_1d).collect();
        let mut coefficients = vec![0.0; SIDE * SIDE];
        for col in 0..SIDE {
            let column: Vec<f64> = (0..SIDE).map(|row| rows[row * SIDE + col]).collect();
            for (row, value) in dct_1d(&column).into_iter().enumerate() {
                coefficients[row * SIDE + col] = value;
            }
        }

        let low: Vec<f64> = (0..LOW)
            .flat_map(|row| (0..LOW).map(move |col| (row, col)))
            .map(|(row, col)| coefficients[row * SIDE + col])
            .collect();
        let mut sorted = low.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let median = (sorted[LOW * LOW / 2 - 1] + sorted[LOW * LOW / 2]) / 2.0;

        let bits = low
            .iter()
            .fold(0u64, |acc, value| (acc << 1) | u64::from(*value > median));
        Some(format!("{bits:016x}"))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPerceptualHasher;

impl PerceptualHasher for NoopPerceptualHasher {
    fn hash(&self, _image: &DynamicImage) -> Option<String> {
        None
    }
}

fn dct_1d(input: &[f64]) -> Vec<f64> {
    let n = input.len() as f64;
    (0..input.len())
        .map(|k| {
            input
                .iter()
                .enumerate()
                .map(|(i, x)| {
                    x * (std::f64::consts::PI * k as f64 * (2.0 * i as f64 + 1.0) / (2.0 * n)).cos()
                })
                .sum::<f64>()
                * 2.0
        })
        .collect()
}

/// Everything known about one accepted image at staging time.
pub struct SidecarInput<'a> {
    pub image_path: &'a Path,
    pub bytes: &'a [u8],
    pub image: &'a DynamicImage,
    pub format: Option<ImageFormat>,
    pub manufacturer: &'a str,
    pub sku: &'a str,
    pub description: Option<&'a str>,
    pub image_url: Option<&'a str>,
    pub page_url: Option<&'a str>,
    pub referer: Option<&'a str>,
}

#[derive(Clone)]
pub struct SidecarBuilder {
    scraper_version: String,
    hasher: Arc<dyn PerceptualHasher>,
}

impl SidecarBuilder {
    pub fn new(scraper_version: impl Into<String>, hasher: Arc<dyn PerceptualHasher>) -> Self {
        Self {
            scraper_version: scraper_version.into(),
            hasher,
        }
    }

    /// DCT hashing when `perceptual_hash` is on, otherwise the no-op hasher.
    pub fn from_flag(scraper_version: impl Into<String>, perceptual_hash: bool) -> Self {
        let hasher: Arc<dyn PerceptualHasher> = if perceptual_hash {
            Arc::new(DctPerceptualHasher)
        } else {
            Arc::new(NoopPerceptualHasher)
        };
        Self::new(scraper_version, hasher)
    }

    pub fn build(&self, input: &SidecarInput<'_>) -> Result<Sidecar, SidecarError> {
        let filename = input
            .image_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| SidecarError::NoFileName(input.image_path.display().to_string()))?;

        Ok(Sidecar {
            image: ImageSection {
                filename,
                format: format_name(input.format),
                width: input.image.width(),
                height: input.image.height(),
                filesize: input.bytes.len() as u64,
                sha256: sha256_hex(input.bytes),
                phash: self.hasher.hash(input.image),
            },
            product: ProductSection {
                manufacturer: input.manufacturer.to_string(),
                sku: input.sku.to_string(),
                description: input.description.map(str::to_string),
                category: None,
            },
            source: SourceSection {
                image_url: input.image_url.map(str::to_string),
                page_url: input.page_url.map(str::to_string),
                referer: input.referer.map(str::to_string),
                license_hint: None,
                found_at: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            },
            ml: MlSection {
                garbage: GarbageLabel::pending(),
            },
            pipeline: PipelineSection {
                scraper_version: self.scraper_version.clone(),
                notes: Vec::new(),
            },
        })
    }

    pub fn build_and_write(&self, input: &SidecarInput<'_>) -> Result<PathBuf, SidecarError> {
        let sidecar = self.build(input)?;
        write_sidecar(input.image_path, &sidecar)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// `<image_path>.json`
pub fn sidecar_path(image_path: &Path) -> PathBuf {
    let mut raw: OsString = image_path.as_os_str().to_owned();
    raw.push(".json");
    PathBuf::from(raw)
}

pub fn write_sidecar(image_path: &Path, sidecar: &Sidecar) -> Result<PathBuf, SidecarError> {
    let path = sidecar_path(image_path);
    let body = serde_json::to_vec(sidecar)?;
    fs::write(&path, body)?;
    Ok(path)
}

fn format_name(format: Option<ImageFormat>) -> String {
    match format {
        Some(ImageFormat::Jpeg) | None => "jpeg".into(),
        Some(ImageFormat::Png) => "png".into(),
        Some(ImageFormat::Gif) => "gif".into(),
        Some(ImageFormat::WebP) => "webp".into(),
        Some(ImageFormat::Bmp) => "bmp".into(),
        Some(ImageFormat::Tiff) => "tiff".into(),
        Some(other) => format!("{other:?}").to_lowercase(),
    }
}
