use image::{DynamicImage, ImageFormat};
use serde::Serialize;
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("filesystem error: {0}")]
    Io(#[from] io::Error),
    #[error("resize failed for {path}: {message}")]
    Resize { path: String, message: String },
}

/// A named output size; images are fit inside `max_edge × max_edge`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantSpec {
    pub name: String,
    pub max_edge: u32,
}

impl VariantSpec {
    pub fn new(name: impl Into<String>, max_edge: u32) -> Self {
        Self {
            name: name.into(),
            max_edge,
        }
    }

    pub fn defaults() -> Vec<Self> {
        vec![Self::new("large", 1200), Self::new("thumb", 256)]
    }

    /// Parses `name:edge[,name:edge...]`, ignoring malformed items.
    pub fn parse_list(raw: &str) -> Vec<Self> {
        raw.split(',')
            .filter_map(|item| {
                let (name, edge) = item.trim().split_once(':')?;
                let name = name.trim();
                let edge = edge.trim().parse::<u32>().ok().filter(|e| *e > 0)?;
                (!name.is_empty()).then(|| Self::new(name, edge))
            })
            .collect()
    }
}

/// Produces the size variants for everything in staging.
pub trait VariantResizer: Send + Sync {
    /// Writes `<dest_dir>/<variant>/<file name>` for each staged image it can decode and
    /// returns the number of files written.
    fn resize_into(&self, staging_dir: &Path, dest_dir: &Path) -> Result<usize, FinalizeError>;
}

pub struct ImageVariantResizer {
    variants: Vec<VariantSpec>,
}

impl ImageVariantResizer {
    pub fn new(variants: Vec<VariantSpec>) -> Self {
        Self { variants }
    }
}

impl VariantResizer for ImageVariantResizer {
    fn resize_into(&self, staging_dir: &Path, dest_dir: &Path) -> Result<usize, FinalizeError> {
        let mut written = 0;
        for source in staged_images(staging_dir)? {
            let Some(file_name) = source.file_name() else {
                continue;
            };
            let image = match fs::read(&source)
                .map_err(|err| err.to_string())
                .and_then(|bytes| image::load_from_memory(&bytes).map_err(|err| err.to_string()))
            {
                Ok(image) => image,
                Err(message) => {
                    warn!(target = "imagery.finalize", path = %source.display(), error = %message, "variant_source_unreadable");
                    continue;
                }
            };

            for variant in &self.variants {
                match write_variant(&image, variant, &dest_dir.join(&variant.name).join(file_name)) {
                    Ok(()) => written += 1,
                    Err(err) => {
                        warn!(target = "imagery.finalize", variant = %variant.name, error = %err, "variant_write_failed");
                    }
                }
            }
        }
        Ok(written)
    }
}

fn write_variant(image: &DynamicImage, variant: &VariantSpec, target: &Path) -> Result<(), FinalizeError> {
    if let Some(dir) = target.parent() {
        fs::create_dir_all(dir)?;
    }
    let resized = if image.width() > variant.max_edge || image.height() > variant.max_edge {
        image.thumbnail(variant.max_edge, variant.max_edge)
    } else {
        image.clone()
    };
    DynamicImage::ImageRgb8(resized.to_rgb8())
        .save_with_format(target, ImageFormat::Jpeg)
        .map_err(|err| FinalizeError::Resize {
            path: target.display().to_string(),
            message: err.to_string(),
        })
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FinalizeReport {
    pub variants_written: usize,
    pub sidecars_copied: usize,
}

#[derive(Clone)]
pub struct StagingFinalizer {
    resizer: Arc<dyn VariantResizer>,
}

impl StagingFinalizer {
    pub fn new(resizer: Arc<dyn VariantResizer>) -> Self {
        Self { resizer }
    }

    pub fn with_variants(variants: Vec<VariantSpec>) -> Self {
        Self::new(Arc::new(ImageVariantResizer::new(variants)))
    }

    /// Resizes staged images into `dest_dir` and brings their sidecars along. Sidecars
    /// are copied for whatever variants exist even when resizing fails. Does not clear
    /// staging; callers run [`clear_staging`] whatever this returns.
    pub fn finalize(&self, staging_dir: &Path, dest_dir: &Path) -> Result<FinalizeReport, FinalizeError> {
        fs::create_dir_all(dest_dir)?;
        let resized = self.resizer.resize_into(staging_dir, dest_dir);
        let sidecars_copied = copy_sidecars(staging_dir, dest_dir)?;
        let variants_written = resized?;
        info!(
            target = "imagery.finalize",
            dest = %dest_dir.display(),
            variants_written,
            sidecars_copied,
            "staging_finalized"
        );
        Ok(FinalizeReport {
            variants_written,
            sidecars_copied,
        })
    }
}

pub fn staging_dir(output_dir: &Path) -> PathBuf {
    output_dir.join("images").join("staging")
}

/// `images/specific/<manufacturer>/<sku>` for host-scoped finds, `images/generic/...`
/// otherwise.
pub fn destination_dir(output_dir: &Path, scoped: bool, manufacturer: &str, sku: &str) -> PathBuf {
    output_dir
        .join("images")
        .join(if scoped { "specific" } else { "generic" })
        .join(path_segment(manufacturer))
        .join(path_segment(sku))
}

fn path_segment(raw: &str) -> String {
    let cleaned = raw.trim().replace(['/', '\\'], "_");
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// Copies each staged `<image>.json` into every variant folder holding `<image>`.
pub fn copy_sidecars(staging_dir: &Path, dest_dir: &Path) -> Result<usize, FinalizeError> {
    if !dest_dir.is_dir() {
        return Ok(0);
    }
    let variant_dirs: Vec<PathBuf> = fs::read_dir(dest_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();

    let mut copied = 0;
    for sidecar in files_in(staging_dir)? {
        let Some(sidecar_name) = sidecar.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(image_name) = sidecar_name.strip_suffix(".json") else {
            continue;
        };
        for variant in &variant_dirs {
            if variant.join(image_name).is_file() {
                fs::copy(&sidecar, variant.join(sidecar_name))?;
                copied += 1;
            }
        }
        debug!(target = "imagery.finalize", sidecar = %sidecar_name, "sidecar_relocated");
    }
    Ok(copied)
}

/// Removes every file in staging. A missing or empty directory is not an error.
pub fn clear_staging(staging_dir: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(staging_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) => {
                warn!(target = "imagery.finalize", path = %path.display(), error = %err, "staging_delete_failed");
            }
        }
    }
    debug!(target = "imagery.finalize", removed, "staging_cleared");
    Ok(removed)
}

fn files_in(dir: &Path) -> Result<Vec<PathBuf>, FinalizeError> {
    let mut files: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err.into()),
    };
    files.sort();
    Ok(files)
}

fn staged_images(dir: &Path) -> Result<Vec<PathBuf>, FinalizeError> {
    Ok(files_in(dir)?
        .into_iter()
        .filter(|path| path.extension().is_none_or(|ext| ext != "json"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::noise_png;

    fn stage(dir: &Path, name: &str, bytes: &[u8]) {
        fs::write(dir.join(name), bytes).expect("stage image");
        fs::write(dir.join(format!("{name}.json")), format!("{{\"image\":{{\"filename\":\"{name}\"}}}}"))
            .expect("stage sidecar");
    }

    #[test]
    fn variant_list_parsing() {
        assert_eq!(
            VariantSpec::parse_list("large:1200, thumb:256,bad,zero:0,:5"),
            vec![VariantSpec::new("large", 1200), VariantSpec::new("thumb", 256)]
        );
    }

    #[test]
    fn destination_layout() {
        let out = Path::new("/out");
        assert_eq!(
            destination_dir(out, true, "Acme", "1001"),
            PathBuf::from("/out/images/specific/Acme/1001")
        );
        assert_eq!(
            destination_dir(out, false, "A/B", ".."),
            PathBuf::from("/out/images/generic/A_B/_")
        );
        assert_eq!(staging_dir(out), PathBuf::from("/out/images/staging"));
    }

    #[test]
    fn finalize_resizes_and_relocates_sidecars() {
        let out = tempfile::tempdir().expect("tempdir");
        let staging = staging_dir(out.path());
        fs::create_dir_all(&staging).expect("staging");
        stage(&staging, "Acme_PN-1_0.jpg", &noise_png(900, 600));
        stage(&staging, "Acme_PN-1_1.jpg", &noise_png(420, 420));
        stage(&staging, "Acme_PN-1_2.jpg", b"not an image");

        let dest = destination_dir(out.path(), true, "Acme", "1001");
        let finalizer = StagingFinalizer::with_variants(VariantSpec::defaults());
        let report = finalizer.finalize(&staging, &dest).expect("finalize");
        assert_eq!(report.variants_written, 4);
        assert_eq!(report.sidecars_copied, 4);

        for variant in ["large", "thumb"] {
            for name in ["Acme_PN-1_0.jpg", "Acme_PN-1_1.jpg"] {
                assert!(dest.join(variant).join(name).is_file());
                assert!(dest.join(variant).join(format!("{name}.json")).is_file());
            }
            assert!(!dest.join(variant).join("Acme_PN-1_2.jpg.json").exists());
        }
        let thumb = image::open(dest.join("thumb/Acme_PN-1_0.jpg")).expect("thumb");
        assert!(thumb.width() <= 256 && thumb.height() <= 256);
        let large = image::open(dest.join("large/Acme_PN-1_1.jpg")).expect("large");
        assert_eq!((large.width(), large.height()), (420, 420));
    }

    struct LargeOnlyFirst;

    impl VariantResizer for LargeOnlyFirst {
        fn resize_into(&self, staging_dir: &Path, dest_dir: &Path) -> Result<usize, FinalizeError> {
            let first = staged_images(staging_dir)?.into_iter().next();
            fs::create_dir_all(dest_dir.join("large"))?;
            fs::create_dir_all(dest_dir.join("thumb"))?;
            if let Some(first) = first {
                let name = first.file_name().expect("file name");
                fs::copy(&first, dest_dir.join("large").join(name))?;
                return Ok(1);
            }
            Ok(0)
        }
    }

    #[test]
    fn sidecars_follow_only_surviving_images() {
        let out = tempfile::tempdir().expect("tempdir");
        let staging = staging_dir(out.path());
        fs::create_dir_all(&staging).expect("staging");
        stage(&staging, "a.jpg", b"a");
        stage(&staging, "b.jpg", b"b");
        let dest = out.path().join("dest");

        let report = StagingFinalizer::new(Arc::new(LargeOnlyFirst))
            .finalize(&staging, &dest)
            .expect("finalize");
        assert_eq!(report.sidecars_copied, 1);
        assert!(dest.join("large/a.jpg.json").is_file());
        assert!(!dest.join("thumb/a.jpg.json").exists());
        assert!(!dest.join("large/b.jpg.json").exists());
    }

    #[test]
    fn one_unwritable_variant_does_not_strand_the_rest() {
        let out = tempfile::tempdir().expect("tempdir");
        let staging = staging_dir(out.path());
        fs::create_dir_all(&staging).expect("staging");
        stage(&staging, "a_0.jpg", &noise_png(300, 300));
        stage(&staging, "a_1.jpg", &noise_png(300, 300));
        let dest = out.path().join("dest");
        fs::create_dir_all(dest.join("large/a_1.jpg")).expect("blocking directory");

        let report = StagingFinalizer::with_variants(VariantSpec::defaults())
            .finalize(&staging, &dest)
            .expect("finalize");
        assert_eq!(report.variants_written, 3);
        assert_eq!(report.sidecars_copied, 3);
        assert!(dest.join("large/a_0.jpg").is_file());
        assert!(dest.join("large/a_0.jpg.json").is_file());
        assert!(dest.join("thumb/a_1.jpg").is_file());
        assert!(dest.join("thumb/a_1.jpg.json").is_file());
        assert!(!dest.join("large/a_1.jpg.json").exists());
    }

    struct Failing;

    impl VariantResizer for Failing {
        fn resize_into(&self, _staging_dir: &Path, dest_dir: &Path) -> Result<usize, FinalizeError> {
            fs::create_dir_all(dest_dir.join("large"))?;
            fs::write(dest_dir.join("large/a.jpg"), b"a")?;
            Err(FinalizeError::Resize {
                path: "b.jpg".into(),
                message: "disk full".into(),
            })
        }
    }

    #[test]
    fn sidecars_are_copied_before_a_resize_error_is_reported() {
        let out = tempfile::tempdir().expect("tempdir");
        let staging = staging_dir(out.path());
        fs::create_dir_all(&staging).expect("staging");
        stage(&staging, "a.jpg", b"a");
        let dest = out.path().join("dest");

        let err = StagingFinalizer::new(Arc::new(Failing))
            .finalize(&staging, &dest)
            .expect_err("resize error");
        assert!(matches!(err, FinalizeError::Resize { .. }));
        assert!(dest.join("large/a.jpg.json").is_file());
    }

    #[test]
    fn clearing_staging_is_idempotent() {
        let out = tempfile::tempdir().expect("tempdir");
        let staging = staging_dir(out.path());
        fs::create_dir_all(&staging).expect("staging");
        stage(&staging, "a.jpg", b"a");

        assert_eq!(clear_staging(&staging).expect("first clear"), 2);
        assert_eq!(fs::read_dir(&staging).expect("read").count(), 0);
        assert_eq!(clear_staging(&staging).expect("second clear"), 0);
        assert_eq!(clear_staging(&staging).expect("third clear"), 0);
        assert_eq!(clear_staging(&out.path().join("missing")).expect("missing dir"), 0);
    }
}
