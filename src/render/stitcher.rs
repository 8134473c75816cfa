//! Vertical page stacking.

use image::{imageops, DynamicImage, RgbImage};

use crate::error::ConversionError;

/// Combines ordered pages into one image.
pub trait Stitcher: Send + Sync {
    fn stitch(&self, pages: Vec<DynamicImage>) -> Result<DynamicImage, ConversionError>;
}

/// Stacks pages top to bottom, left-aligned on a black canvas as wide as the
/// widest page.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerticalStitcher;

impl Stitcher for VerticalStitcher {
    fn stitch(&self, mut pages: Vec<DynamicImage>) -> Result<DynamicImage, ConversionError> {
        if pages.len() <= 1 {
            return pages.pop().map(to_rgb).ok_or(ConversionError::NoPages);
        }

        let width = pages.iter().map(|p| p.width()).max().unwrap_or(0);
        let height = pages
            .iter()
            .try_fold(0u32, |total, page| total.checked_add(page.height()))
            .ok_or_else(|| {
                ConversionError::Stitch(format!(
                    "{} pages are taller than {} pixels combined",
                    pages.len(),
                    u32::MAX
                ))
            })?;

        let mut canvas = RgbImage::new(width, height);
        let mut top = 0i64;
        for page in pages {
            let rows = i64::from(page.height());
            imageops::replace(&mut canvas, &page.into_rgb8(), 0, top);
            top += rows;
        }
        Ok(DynamicImage::ImageRgb8(canvas))
    }
}

fn to_rgb(page: DynamicImage) -> DynamicImage {
    match page {
        DynamicImage::ImageRgb8(_) => page,
        other => DynamicImage::ImageRgb8(other.into_rgb8()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn page(width: u32, height: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([value, value, value])))
    }

    #[test]
    fn test_stacks_pages_in_order() {
        let stitched = VerticalStitcher
            .stitch(vec![page(100, 30, 10), page(60, 20, 200)])
            .unwrap()
            .into_rgb8();

        assert_eq!(stitched.dimensions(), (100, 50));
        assert_eq!(stitched.get_pixel(0, 0), &Rgb([10, 10, 10]));
        assert_eq!(stitched.get_pixel(0, 29), &Rgb([10, 10, 10]));
        assert_eq!(stitched.get_pixel(0, 30), &Rgb([200, 200, 200]));
        // Narrow page leaves the canvas background to its right.
        assert_eq!(stitched.get_pixel(80, 40), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_single_page_passes_through() {
        let stitched = VerticalStitcher.stitch(vec![page(40, 70, 5)]).unwrap();
        assert_eq!((stitched.width(), stitched.height()), (40, 70));
    }

    #[test]
    fn test_no_pages() {
        assert!(matches!(
            VerticalStitcher.stitch(Vec::new()),
            Err(ConversionError::NoPages)
        ));
    }
}
