use crate::pipeline::types::BBox;
use anyhow::{bail, Result};
use opencv::core::{self, Mat, Rect, Scalar, Size};
use opencv::imgproc;
use opencv::prelude::*;

pub const DEFAULT_MASK_PADDING: i32 = 15;
pub const DEFAULT_STRIDE: i32 = 8;

/// Expand `bbox` by `padding` and clamp it to a `width` x `height` frame.
/// Returns `None` when nothing of the box remains inside the frame.
pub fn padded_region(bbox: &BBox, width: i32, height: i32, padding: i32) -> Option<Rect> {
    let padding = padding.max(0);
    let x1 = (bbox.x1 - padding).clamp(0, width);
    let y1 = (bbox.y1 - padding).clamp(0, height);
    let x2 = (bbox.x2 + padding).clamp(0, width);
    let y2 = (bbox.y2 + padding).clamp(0, height);

    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(Rect::new(x1, y1, x2 - x1, y2 - y1))
}

/// Build a single-channel mask of the frame's size with 255 inside the padded region.
pub fn build_mask(width: i32, height: i32, bbox: &BBox, padding: i32) -> Result<Mat> {
    if width <= 0 || height <= 0 {
        bail!("Invalid frame dimensions for mask: {}x{}", width, height);
    }

    let mut mask = Mat::new_rows_cols_with_default(height, width, core::CV_8UC1, Scalar::all(0.0))?;
    if let Some(region) = padded_region(bbox, width, height, padding) {
        imgproc::rectangle(
            &mut mask,
            region,
            Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )?;
    }
    Ok(mask)
}

/// Extra pixels needed to round `len` up to a multiple of `stride`.
pub fn stride_padding(len: i32, stride: i32) -> i32 {
    if stride <= 1 {
        return 0;
    }
    (stride - len % stride) % stride
}

/// Image and mask padded on the bottom/right to a stride multiple.
pub struct StridePadded {
    pub image: Mat,
    pub mask: Mat,
    pub original: Size,
}

/// Reflect-pad the image and zero-pad the mask up to the next stride multiple.
pub fn pad_to_stride(image: &Mat, mask: &Mat, stride: i32) -> Result<StridePadded> {
    let size = image.size()?;
    if mask.size()? != size {
        bail!(
            "Mask size {:?} does not match image size {:?}",
            mask.size()?,
            size
        );
    }

    let pad_h = stride_padding(size.height, stride);
    let pad_w = stride_padding(size.width, stride);

    if pad_h == 0 && pad_w == 0 {
        return Ok(StridePadded {
            image: image.try_clone()?,
            mask: mask.try_clone()?,
            original: size,
        });
    }

    let mut padded_image = Mat::default();
    core::copy_make_border(
        image,
        &mut padded_image,
        0,
        pad_h,
        0,
        pad_w,
        core::BORDER_REFLECT_101,
        Scalar::default(),
    )?;

    let mut padded_mask = Mat::default();
    core::copy_make_border(
        mask,
        &mut padded_mask,
        0,
        pad_h,
        0,
        pad_w,
        core::BORDER_CONSTANT,
        Scalar::all(0.0),
    )?;

    Ok(StridePadded {
        image: padded_image,
        mask: padded_mask,
        original: size,
    })
}

/// Crop the top-left `size` region back out of a padded result.
pub fn crop_to(image: &Mat, size: Size) -> Result<Mat> {
    let current = image.size()?;
    if current == size {
        return Ok(image.try_clone()?);
    }
    if current.width < size.width || current.height < size.height {
        bail!(
            "Cannot crop {}x{} result to {}x{}",
            current.width,
            current.height,
            size.width,
            size.height
        );
    }

    let roi = Mat::roi(image, Rect::new(0, 0, size.width, size.height))?;
    let mut out = Mat::default();
    roi.copy_to(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_region_clamps_to_frame() {
        let bbox = BBox::new(5, 5, 50, 40).unwrap();
        let region = padded_region(&bbox, 100, 60, 15).unwrap();
        assert_eq!(region, Rect::new(0, 0, 65, 55));

        let edge = BBox::new(90, 50, 110, 70).unwrap();
        let region = padded_region(&edge, 100, 60, 5).unwrap();
        assert_eq!(region, Rect::new(85, 45, 15, 15));
    }

    #[test]
    fn test_padded_region_outside_frame_is_none() {
        let bbox = BBox::new(200, 200, 240, 220).unwrap();
        assert!(padded_region(&bbox, 100, 100, 10).is_none());
    }

    #[test]
    fn test_mask_matches_frame_and_region_area() {
        let bbox = BBox::new(20, 30, 60, 50).unwrap();
        let mask = build_mask(128, 72, &bbox, 10).unwrap();
        assert_eq!(mask.rows(), 72);
        assert_eq!(mask.cols(), 128);
        assert_eq!(mask.typ(), core::CV_8UC1);

        let region = padded_region(&bbox, 128, 72, 10).unwrap();
        let marked = core::count_non_zero(&mask).unwrap();
        assert_eq!(marked, region.area());
        assert!(marked as i64 <= 128 * 72);
    }

    #[test]
    fn test_mask_never_exceeds_frame_area() {
        let huge = BBox::new(-500, -500, 5000, 5000).unwrap();
        let mask = build_mask(64, 48, &huge, 15).unwrap();
        assert_eq!(core::count_non_zero(&mask).unwrap(), 64 * 48);
    }

    #[test]
    fn test_stride_padding() {
        assert_eq!(stride_padding(1080, 8), 0);
        assert_eq!(stride_padding(1081, 8), 7);
        assert_eq!(stride_padding(725, 8), 3);
        assert_eq!(stride_padding(725, 1), 0);
    }

    #[test]
    fn test_pad_to_stride_and_crop_back() {
        let image =
            Mat::new_rows_cols_with_default(21, 30, core::CV_8UC3, Scalar::all(90.0)).unwrap();
        let mask = build_mask(30, 21, &BBox::new(2, 2, 10, 10).unwrap(), 0).unwrap();

        let padded = pad_to_stride(&image, &mask, 8).unwrap();
        assert_eq!(padded.image.rows(), 24);
        assert_eq!(padded.image.cols(), 32);
        assert_eq!(padded.mask.rows(), 24);
        assert_eq!(padded.mask.cols(), 32);
        // Zero padding adds no masked pixels.
        assert_eq!(
            core::count_non_zero(&padded.mask).unwrap(),
            core::count_non_zero(&mask).unwrap()
        );

        let restored = crop_to(&padded.image, padded.original).unwrap();
        assert_eq!(restored.size().unwrap(), Size::new(30, 21));
    }
}
