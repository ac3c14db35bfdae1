use crate::error::{PipelineError, Result};
use crate::types::{CameraView, FrameInfo};
use base64::{engine::general_purpose::STANDARD, Engine};
use image::GenericImageView;
use std::io::Cursor;
use std::path::{Path, PathBuf};

/// A camera image as handed to the pipeline.
#[derive(Debug, Clone)]
pub struct CameraImage {
    pub view: CameraView,
    pub path: PathBuf,
}

impl CameraImage {
    pub fn new(view: CameraView, path: impl Into<PathBuf>) -> Self {
        Self {
            view,
            path: path.into(),
        }
    }
}

/// A camera image with its declared pixel dimensions.
#[derive(Debug, Clone)]
pub struct Frame {
    pub view: CameraView,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn info(&self) -> FrameInfo {
        FrameInfo {
            view: self.view,
            width: self.width,
            height: self.height,
        }
    }
}

/// Read only the header of the image to learn its dimensions.
pub fn load_frame(image: &CameraImage) -> Result<Frame> {
    let (width, height) = image::image_dimensions(&image.path).map_err(|source| PipelineError::Image {
        path: image.path.clone(),
        source,
    })?;

    Ok(Frame {
        view: image.view,
        path: image.path.clone(),
        width,
        height,
    })
}

/// Encoded frame ready for the VLM, plus factors mapping its pixels back to the original.
pub struct EncodedFrame {
    pub base64: String,
    pub scale_x: f64,
    pub scale_y: f64,
}

/// Downsize to fit within `max_width`×`max_height` (never upscaling), PNG-encode, base64.
pub fn encode_for_vlm(path: &Path, max_width: u32, max_height: u32) -> Result<EncodedFrame> {
    let img = image::open(path).map_err(|source| PipelineError::Image {
        path: path.to_path_buf(),
        source,
    })?;

    let (orig_width, orig_height) = img.dimensions();

    let scale_x = max_width as f64 / orig_width as f64;
    let scale_y = max_height as f64 / orig_height as f64;
    let scale = scale_x.min(scale_y).min(1.0);

    let new_width = ((orig_width as f64 * scale) as u32).max(1);
    let new_height = ((orig_height as f64 * scale) as u32).max(1);

    let resized = if scale < 1.0 {
        img.resize(new_width, new_height, image::imageops::FilterType::Triangle)
    } else {
        img
    };

    let mut buffer = Cursor::new(Vec::new());
    resized
        .write_to(&mut buffer, image::ImageFormat::Png)
        .map_err(|source| PipelineError::Image {
            path: path.to_path_buf(),
            source,
        })?;

    let (enc_width, enc_height) = resized.dimensions();
    Ok(EncodedFrame {
        base64: STANDARD.encode(buffer.into_inner()),
        scale_x: orig_width as f64 / enc_width as f64,
        scale_y: orig_height as f64 / enc_height as f64,
    })
}
