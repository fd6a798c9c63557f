//! Album-art download, aspect-preserving resize, and on-disk cache.

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use image::{imageops::FilterType, DynamicImage, GenericImageView, ImageFormat};
use log::debug;

const COVER_CACHE_VERSION: &str = "cover-v1";
const MAX_COVER_BYTES: u64 = 8 * 1024 * 1024;

/// Downloads covers and keeps resized PNG copies under the cache directory.
pub struct CoverArtCache {
    http_client: ureq::Agent,
    root: PathBuf,
    max_edge_px: u32,
}

impl CoverArtCache {
    pub fn new(root: PathBuf, max_edge_px: u32, request_timeout: Duration) -> Self {
        Self {
            http_client: ureq::AgentBuilder::new()
                .timeout_connect(Duration::from_secs(5))
                .timeout(request_timeout)
                .build(),
            root,
            max_edge_px: max_edge_px.max(1),
        }
    }

    /// `<cache_dir>/tunebar/covers/<edge>`.
    pub fn default_root(max_edge_px: u32) -> Option<PathBuf> {
        dirs::cache_dir().map(|path| {
            path.join("tunebar")
                .join("covers")
                .join(max_edge_px.max(1).to_string())
        })
    }

    pub fn cached_path(&self, url: &str) -> PathBuf {
        let stem = hash_string(&format!("{COVER_CACHE_VERSION}|{}|{url}", self.max_edge_px));
        self.root.join(format!("{stem}.png"))
    }

    /// Returns the resized cover for `url`, downloading it on first use.
    pub fn fetch(&self, url: &str) -> Result<PathBuf, String> {
        let target_path = self.cached_path(url);
        if target_path.exists() {
            return Ok(target_path);
        }

        let response = self
            .http_client
            .get(url)
            .call()
            .map_err(|err| format!("cover download failed: {err}"))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_COVER_BYTES)
            .read_to_end(&mut bytes)
            .map_err(|err| format!("cover download failed: {err}"))?;

        let cover = prepare_cover(&bytes, self.max_edge_px)?;
        save_png_atomic(&cover, &target_path)?;
        debug!(
            "CoverArtCache: cached {}x{} cover at {}",
            cover.width(),
            cover.height(),
            target_path.display()
        );
        Ok(target_path)
    }
}

fn hash_string(value: &str) -> String {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// Decodes `bytes` and shrinks the image to fit a `max_edge` square.
pub fn prepare_cover(bytes: &[u8], max_edge: u32) -> Result<DynamicImage, String> {
    let decoded =
        image::load_from_memory(bytes).map_err(|err| format!("cover decode failed: {err}"))?;
    let (width, height) = decoded.dimensions();
    let (target_width, target_height) = fit_to_max_edge(width, height, max_edge);
    if (target_width, target_height) == (width, height) {
        return Ok(decoded);
    }
    Ok(decoded.resize_exact(target_width, target_height, FilterType::Lanczos3))
}

fn fit_to_max_edge(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (1, 1);
    }
    let clamped = max_edge.max(1);
    if width.max(height) <= clamped {
        return (width, height);
    }
    if width >= height {
        let scaled_height =
            ((u64::from(height) * u64::from(clamped)) + (u64::from(width) / 2)) / u64::from(width);
        (clamped, scaled_height.max(1) as u32)
    } else {
        let scaled_width =
            ((u64::from(width) * u64::from(clamped)) + (u64::from(height) / 2)) / u64::from(height);
        (scaled_width.max(1) as u32, clamped)
    }
}

fn save_png_atomic(image: &DynamicImage, target_path: &Path) -> Result<(), String> {
    if let Some(parent) = target_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("failed to create cover cache {}: {err}", parent.display()))?;
    }
    let temp_path = target_path.with_extension("png.tmp");
    image
        .save_with_format(&temp_path, ImageFormat::Png)
        .map_err(|err| format!("failed to write cover {}: {err}", temp_path.display()))?;
    fs::rename(&temp_path, target_path)
        .map_err(|err| format!("failed to move cover into place: {err}"))
}
