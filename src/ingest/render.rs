use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::GenericImageView;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::MediaConfig;

/// Per-item processing failure. Recorded on the item, never fatal.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Render task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Source image is empty")]
    Empty,
}

/// Dimensions of a source and of the rendition written for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rendition {
    pub width: u32,
    pub height: u32,
    pub display_width: u32,
    pub display_height: u32,
}

/// Produces the display-ready rendition of a source file
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, source: &Path, target: &Path) -> Result<Rendition, IngestError>;
}

/// JPEG renditions bounded to the configured display size
#[derive(Debug, Clone)]
pub struct ImageRenderer {
    max_width: u32,
    max_height: u32,
    quality: u8,
}

impl ImageRenderer {
    pub fn new(max_width: u32, max_height: u32, quality: u8) -> Self {
        Self {
            max_width: max_width.max(1),
            max_height: max_height.max(1),
            quality: quality.clamp(1, 100),
        }
    }

    pub fn from_config(media: &MediaConfig) -> Self {
        Self::new(media.display_width, media.display_height, media.jpeg_quality)
    }

    fn render_blocking(&self, source: &Path, target: &Path) -> Result<Rendition, IngestError> {
        let img = image::open(source)?;
        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            return Err(IngestError::Empty);
        }

        // Fit inside the display box, never enlarge
        let img = if width > self.max_width || height > self.max_height {
            img.resize(self.max_width, self.max_height, FilterType::Lanczos3)
        } else {
            img
        };
        let rgb = img.to_rgb8();

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = tmp_path_for(target);
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            let encoded = JpegEncoder::new_with_quality(&mut out, self.quality).encode_image(&rgb);
            let written = encoded
                .map_err(IngestError::from)
                .and_then(|_| out.flush().map_err(IngestError::from));
            if let Err(e) = written {
                let _ = std::fs::remove_file(&tmp);
                return Err(e);
            }
        }
        std::fs::rename(&tmp, target)?;

        Ok(Rendition {
            width,
            height,
            display_width: rgb.width(),
            display_height: rgb.height(),
        })
    }
}

#[async_trait]
impl Renderer for ImageRenderer {
    async fn render(&self, source: &Path, target: &Path) -> Result<Rendition, IngestError> {
        let renderer = self.clone();
        let source = source.to_path_buf();
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || renderer.render_blocking(&source, &target)).await?
    }
}

fn tmp_path_for(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    target.with_file_name(name)
}
