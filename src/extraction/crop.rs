//! Cutting a region out of a page and preparing it for recognition.

use std::{io::Cursor, sync::Arc};

use image::{DynamicImage, ImageFormat, imageops::FilterType};

use crate::{
    async_utils::spawn_blocking_propagating_panics, geometry::Region, pages::PageImage,
    prelude::*, recognizers::RecognitionImage,
};

/// Crop `region` out of `page`, upscale it by `factor`, and encode as PNG.
///
/// This runs on the blocking pool and always runs to completion once started.
pub async fn crop_region(
    page: &PageImage,
    region: &Region,
    factor: u32,
) -> Result<RecognitionImage> {
    let (x, y, width, height) = region
        .crop_bounds(page.width, page.height)
        .ok_or_else(|| {
            anyhow!(
                "region {:?} at ({}, {}) lies outside the {}x{} page",
                region.field_name(),
                region.x(),
                region.y(),
                page.width,
                page.height
            )
        })?;
    let pixels = Arc::clone(&page.pixels);
    spawn_blocking_propagating_panics(move || {
        crop_and_encode(&pixels, (x, y, width, height), factor)
    })
    .await
}

/// The synchronous part of [`crop_region`].
fn crop_and_encode(
    pixels: &DynamicImage,
    (x, y, width, height): (u32, u32, u32, u32),
    factor: u32,
) -> Result<RecognitionImage> {
    let crop = pixels.crop_imm(x, y, width, height);
    let scaled = if factor > 1 {
        let scaled_width = width
            .checked_mul(factor)
            .ok_or_else(|| anyhow!("upscaled crop is too wide"))?;
        let scaled_height = height
            .checked_mul(factor)
            .ok_or_else(|| anyhow!("upscaled crop is too tall"))?;
        crop.resize_exact(scaled_width, scaled_height, FilterType::Lanczos3)
    } else {
        crop
    };

    // PNG can't hold every pixel format `image` supports, so normalize.
    let rgb = DynamicImage::ImageRgb8(scaled.to_rgb8());
    let mut png = vec![];
    rgb.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .context("failed to encode crop as PNG")?;
    Ok(RecognitionImage {
        png,
        width: rgb.width(),
        height: rgb.height(),
    })
}
