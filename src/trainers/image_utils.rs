//! Image utilities for the batch-preview channel
//!
//! Tiles a batch of images into a grid tensor and saves tensors as image
//! files. The preview channel is best-effort; callers log failures and move
//! on.

use anyhow::{Context, Result};
use candle_core::{DType, IndexOp, Tensor};
use std::path::Path;

/// Tile a batch `[B, C, H, W]` into a single grid image `[C, rows*H, cols*W]`.
/// Missing cells in the last row are filled with black.
pub fn image_grid(batch: &Tensor, columns: usize) -> Result<Tensor> {
    let (b, c, h, w) = batch
        .dims4()
        .context("Expected a 4D batch tensor [B, C, H, W]")?;
    let columns = columns.clamp(1, b);
    let rows = b.div_ceil(columns);
    let blank = Tensor::zeros((c, h, w), batch.dtype(), batch.device())?;

    let mut row_tensors = Vec::with_capacity(rows);
    for row in 0..rows {
        let mut cells = Vec::with_capacity(columns);
        for col in 0..columns {
            let index = row * columns + col;
            if index < b {
                cells.push(batch.i(index)?);
            } else {
                cells.push(blank.clone());
            }
        }
        let cells: Vec<&Tensor> = cells.iter().collect();
        row_tensors.push(Tensor::cat(&cells, 2)?);
    }
    let rows: Vec<&Tensor> = row_tensors.iter().collect();
    Ok(Tensor::cat(&rows, 1)?)
}

/// Save a `[C, H, W]` tensor with values in `[-1, 1]` as an image file.
/// Single-channel tensors are expanded to RGB.
pub fn save_image<P: AsRef<Path>>(tensor: &Tensor, path: P) -> Result<()> {
    // Convert from [-1, 1] to [0, 255]
    let tensor = ((tensor.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?;
    let tensor = tensor.to_dtype(DType::U8)?;

    let (channels, height, width) = tensor
        .dims3()
        .context("Expected 3D tensor [C, H, W]")?;
    let tensor = match channels {
        3 => tensor,
        1 => Tensor::cat(&[&tensor, &tensor, &tensor], 0)?,
        _ => anyhow::bail!("Expected 1 or 3 channels, got {channels}"),
    };

    // Permute from CHW to HWC for the image crate
    let tensor = tensor.permute((1, 2, 0))?;
    let data = tensor.flatten_all()?.to_vec1::<u8>()?;

    let img = image::ImageBuffer::<image::Rgb<u8>, Vec<u8>>::from_raw(
        width as u32,
        height as u32,
        data,
    )
    .context("Failed to create image buffer")?;

    let path = path.as_ref();
    match path.extension().and_then(|s| s.to_str()) {
        Some("jpg") | Some("jpeg") => {
            img.save_with_format(path, image::ImageFormat::Jpeg)?;
        }
        _ => {
            img.save_with_format(path, image::ImageFormat::Png)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn grid_tiles_a_full_batch() {
        let device = Device::Cpu;
        let batch = Tensor::rand(-1f32, 1f32, (4, 3, 8, 8), &device).unwrap();
        let grid = image_grid(&batch, 2).unwrap();
        assert_eq!(grid.dims(), &[3, 16, 16]);
    }

    #[test]
    fn grid_pads_a_ragged_last_row() {
        let device = Device::Cpu;
        let batch = Tensor::rand(-1f32, 1f32, (5, 1, 4, 4), &device).unwrap();
        let grid = image_grid(&batch, 3).unwrap();
        assert_eq!(grid.dims(), &[1, 8, 12]);
    }

    #[test]
    fn save_image_writes_png_for_gray_and_rgb() {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();

        let rgb = Tensor::rand(-1f32, 1f32, (3, 8, 8), &device).unwrap();
        let rgb_path = dir.path().join("rgb.png");
        save_image(&rgb, &rgb_path).unwrap();
        assert!(rgb_path.exists());

        let gray = Tensor::rand(-1f32, 1f32, (1, 8, 8), &device).unwrap();
        let gray_path = dir.path().join("gray.png");
        save_image(&gray, &gray_path).unwrap();
        assert!(gray_path.exists());
    }
}
