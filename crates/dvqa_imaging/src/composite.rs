//! Compositing heatmaps onto the source image.

use ab_glyph::{FontRef, PxScale};
use image::{GrayImage, Rgb, RgbImage, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use dvqa_core::{CoreError, Region, Result};

use crate::heatmap::Heatmap;

/// Background used when flattening overlays.
pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

/// Outline thickness of detector boxes, in pixels.
const BOX_THICKNESS: u32 = 2;

/// Embedded label font.
const LABEL_FONT: &[u8] = include_bytes!("../assets/DejaVuSansMono.ttf");

/// Label glyph height, in pixels.
const LABEL_SCALE: f32 = 12.0;

/// Padding around label text, in pixels.
const LABEL_PADDING: u32 = 2;

/// Outline colours, indexed by object class id.
const PALETTE: [Rgb<u8>; 10] = [
    Rgb([230, 25, 75]),
    Rgb([60, 180, 75]),
    Rgb([255, 225, 25]),
    Rgb([0, 130, 200]),
    Rgb([245, 130, 48]),
    Rgb([145, 30, 180]),
    Rgb([70, 240, 240]),
    Rgb([240, 50, 230]),
    Rgb([210, 245, 60]),
    Rgb([250, 190, 212]),
];

/// Outline colour for an object class.
#[must_use]
pub fn class_color(class_id: usize) -> Rgb<u8> {
    PALETTE[class_id % PALETTE.len()]
}

fn check_size(what: &str, a: (u32, u32), b: (u32, u32)) -> Result<()> {
    if a != b {
        return Err(CoreError::ShapeMismatch(format!(
            "{what}: {}x{} vs {}x{}",
            a.0, a.1, b.0, b.1
        )));
    }
    Ok(())
}

/// Use a grey heatmap as the alpha channel of the source image.
///
/// # Errors
///
/// Returns [`CoreError::ShapeMismatch`] if the sizes differ.
pub fn alpha_overlay(source: &RgbImage, heat: &GrayImage) -> Result<RgbaImage> {
    check_size("overlay", source.dimensions(), heat.dimensions())?;
    Ok(RgbaImage::from_fn(source.width(), source.height(), |x, y| {
        let Rgb([r, g, b]) = *source.get_pixel(x, y);
        Rgba([r, g, b, heat.get_pixel(x, y)[0]])
    }))
}

/// Paint overlays on top of each other in order.
///
/// Starts from a copy of the first overlay; every later overlay replaces the
/// pixels where its alpha is non-zero.
///
/// # Errors
///
/// Returns [`CoreError::InvalidShape`] for an empty list and
/// [`CoreError::ShapeMismatch`] if the overlays differ in size.
pub fn combine_overlays(overlays: &[RgbaImage]) -> Result<RgbaImage> {
    let (first, rest) = overlays.split_first().ok_or_else(|| CoreError::InvalidShape {
        expected: "at least one overlay".to_string(),
        got: "0 overlays".to_string(),
    })?;
    let mut combined = first.clone();
    for overlay in rest {
        check_size("combined overlay", combined.dimensions(), overlay.dimensions())?;
        for (dst, src) in combined.pixels_mut().zip(overlay.pixels()) {
            if src[3] > 0 {
                *dst = *src;
            }
        }
    }
    Ok(combined)
}

/// Alpha-blend an RGBA image over a solid background.
#[must_use]
pub fn flatten_rgba(rgba: &RgbaImage, background: Rgb<u8>) -> RgbImage {
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let Rgba([r, g, b, a]) = *rgba.get_pixel(x, y);
        let alpha = f32::from(a) / 255.0;
        let mix = |fg: u8, bg: u8| {
            (f32::from(fg) * alpha + f32::from(bg) * (1.0 - alpha))
                .round()
                .clamp(0.0, 255.0) as u8
        };
        Rgb([
            mix(r, background[0]),
            mix(g, background[1]),
            mix(b, background[2]),
        ])
    })
}

/// Multiply every pixel by its heat and rescale to full brightness.
///
/// The brightest resulting channel value becomes 255. If every product is
/// zero the output is black.
///
/// # Errors
///
/// Returns [`CoreError::ShapeMismatch`] if the heatmap is not image-sized.
pub fn multiplicative_blend(source: &RgbImage, heat: &Heatmap) -> Result<RgbImage> {
    check_size(
        "multiplicative blend",
        source.dimensions(),
        (heat.width(), heat.height()),
    )?;
    let weighted: Vec<f32> = source
        .enumerate_pixels()
        .flat_map(|(x, y, px)| {
            let h = heat.get(x, y).unwrap_or(0.0);
            px.0.map(|c| f32::from(c) * h)
        })
        .collect();

    let max = weighted.iter().copied().fold(0.0f32, f32::max);
    let raw: Vec<u8> = if max > 0.0 && max.is_finite() {
        weighted
            .iter()
            .map(|v| (v / max * 255.0).clamp(0.0, 255.0) as u8)
            .collect()
    } else {
        tracing::debug!("blend has no bright pixel, returning black image");
        vec![0; weighted.len()]
    };
    RgbImage::from_raw(source.width(), source.height(), raw)
        .ok_or_else(|| CoreError::Other("blend buffer size".to_string()))
}

/// Text drawn next to a region: attribute, object and object score.
#[must_use]
pub fn region_label(region: &Region) -> String {
    format!(
        "{} {} {:.2}",
        region.attribute.name, region.object.name, region.object.score
    )
}

/// Detector overview: the source image with one outline and one label per
/// region.
///
/// Labels sit on a filled band in the class colour, above the box when
/// there is room and just inside its top edge otherwise.
///
/// # Errors
///
/// Returns [`CoreError::Other`] if the embedded label font cannot be parsed.
pub fn draw_regions(source: &RgbImage, regions: &[Region]) -> Result<RgbImage> {
    let mut canvas = source.clone();
    if regions.is_empty() {
        return Ok(canvas);
    }
    let font = FontRef::try_from_slice(LABEL_FONT)
        .map_err(|e| CoreError::Other(format!("label font: {e}")))?;
    let scale = PxScale::from(LABEL_SCALE);

    let (width, height) = canvas.dimensions();
    for region in regions {
        let (x0, y0, x1, y1) = region.bbox.clamp_to(width, height);
        let color = class_color(region.object.id);
        for t in 0..BOX_THICKNESS {
            let w = (x1 - x0).saturating_sub(2 * t);
            let h = (y1 - y0).saturating_sub(2 * t);
            if w == 0 || h == 0 {
                break;
            }
            let rect = Rect::at((x0 + t) as i32, (y0 + t) as i32).of_size(w, h);
            draw_hollow_rect_mut(&mut canvas, rect, color);
        }
        if x1 <= x0 || y1 <= y0 {
            continue;
        }

        let text = region_label(region);
        let (text_w, text_h) = text_size(scale, &font, &text);
        let band_w = text_w + 2 * LABEL_PADDING;
        let band_h = text_h.max(1) + 2 * LABEL_PADDING;
        let band_y = if y0 >= band_h { y0 - band_h } else { y0 };
        draw_filled_rect_mut(
            &mut canvas,
            Rect::at(x0 as i32, band_y as i32).of_size(band_w, band_h),
            color,
        );
        draw_text_mut(
            &mut canvas,
            WHITE,
            (x0 + LABEL_PADDING) as i32,
            (band_y + LABEL_PADDING) as i32,
            scale,
            &font,
            &text,
        );
    }
    Ok(canvas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvqa_core::{BoundingBox, DetectedLabel};
    use image::Luma;

    fn source(w: u32, h: u32) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb([100, 50, 200]))
    }

    #[test]
    fn test_alpha_overlay_uses_heat() {
        let mut heat = GrayImage::new(2, 2);
        heat.put_pixel(1, 0, Luma([128]));
        let rgba = alpha_overlay(&source(2, 2), &heat).unwrap();
        assert_eq!(rgba.get_pixel(1, 0).0, [100, 50, 200, 128]);
        assert_eq!(rgba.get_pixel(0, 0)[3], 0);

        assert!(alpha_overlay(&source(3, 2), &heat).is_err());
    }

    #[test]
    fn test_combine_last_write_wins() {
        let mut a = RgbaImage::from_pixel(2, 1, Rgba([1, 1, 1, 10]));
        a.put_pixel(1, 0, Rgba([2, 2, 2, 20]));
        let mut b = RgbaImage::new(2, 1);
        b.put_pixel(1, 0, Rgba([9, 9, 9, 90]));

        let combined = combine_overlays(&[a.clone(), b]).unwrap();
        assert_eq!(combined.get_pixel(0, 0).0, [1, 1, 1, 10]);
        assert_eq!(combined.get_pixel(1, 0).0, [9, 9, 9, 90]);
        // The first overlay is not modified.
        assert_eq!(a.get_pixel(1, 0).0, [2, 2, 2, 20]);

        assert!(combine_overlays(&[]).is_err());
        assert!(combine_overlays(&[a, RgbaImage::new(3, 1)]).is_err());
    }

    #[test]
    fn test_flatten_over_white() {
        let mut rgba = RgbaImage::new(2, 1);
        rgba.put_pixel(1, 0, Rgba([0, 0, 0, 255]));
        let rgb = flatten_rgba(&rgba, WHITE);
        assert_eq!(rgb.get_pixel(0, 0).0, [255, 255, 255]);
        assert_eq!(rgb.get_pixel(1, 0).0, [0, 0, 0]);
    }

    #[test]
    fn test_multiplicative_blend_rescales() {
        let heat = Heatmap::new(2, 1, vec![0.5, 0.0]).unwrap();
        let out = multiplicative_blend(&source(2, 1), &heat).unwrap();
        // 200 * 0.5 = 100 is the brightest channel and maps to 255.
        assert_eq!(out.get_pixel(0, 0)[2], 255);
        assert_eq!(out.get_pixel(0, 0)[0], 127);
        assert_eq!(out.get_pixel(1, 0).0, [0, 0, 0]);
    }

    #[test]
    fn test_multiplicative_blend_black() {
        let out = multiplicative_blend(&source(3, 3), &Heatmap::zeros(3, 3)).unwrap();
        assert!(out.pixels().all(|p| p.0 == [0, 0, 0]));
        assert!(multiplicative_blend(&source(3, 3), &Heatmap::zeros(2, 3)).is_err());
    }

    fn region(x0: f32, y0: f32, x1: f32, y1: f32, class: usize) -> Region {
        Region {
            bbox: BoundingBox::new(x0, y0, x1, y1),
            object: DetectedLabel {
                id: class,
                name: "truck".to_string(),
                score: 0.87,
            },
            attribute: DetectedLabel {
                id: 0,
                name: "red".to_string(),
                score: 0.6,
            },
        }
    }

    #[test]
    fn test_region_label() {
        assert_eq!(region_label(&region(0.0, 0.0, 1.0, 1.0, 0)), "red truck 0.87");
    }

    #[test]
    fn test_draw_regions_outline() {
        // Box near the bottom so the label band lies above it.
        let img = RgbImage::new(64, 64);
        let out = draw_regions(&img, &[region(2.0, 40.0, 12.0, 50.0, 3)]).unwrap();
        assert_eq!(*out.get_pixel(2, 40), class_color(3));
        assert_eq!(*out.get_pixel(3, 41), class_color(3));
        assert_eq!(out.get_pixel(7, 45).0, [0, 0, 0]);
        assert_eq!(out.get_pixel(63, 63).0, [0, 0, 0]);

        assert_eq!(draw_regions(&img, &[]).unwrap(), img);
    }

    #[test]
    fn test_draw_regions_labels_outside_outline() {
        let img = RgbImage::new(100, 100);
        let out = draw_regions(&img, &[region(30.0, 40.0, 70.0, 80.0, 1)]).unwrap();

        let inside_box = |x: u32, y: u32| (30..70).contains(&x) && (40..80).contains(&y);
        let changed_outside = out
            .enumerate_pixels()
            .filter(|(x, y, p)| !inside_box(*x, *y) && p.0 != [0, 0, 0])
            .count();
        assert!(changed_outside > 0);

        // Glyphs are drawn over the band, so it is not a flat fill.
        let band: Vec<Rgb<u8>> = (25..40)
            .flat_map(|y| (30..90).map(move |x| (x, y)))
            .map(|(x, y)| *out.get_pixel(x, y))
            .collect();
        assert!(band.iter().any(|p| *p == class_color(1)));
        assert!(band.iter().any(|p| *p != class_color(1) && p.0 != [0, 0, 0]));
    }

    #[test]
    fn test_draw_regions_label_inside_at_top_edge() {
        let img = RgbImage::new(100, 100);
        let out = draw_regions(&img, &[region(10.0, 0.0, 60.0, 50.0, 2)]).unwrap();
        // No room above, the band covers the inside of the top edge.
        assert_eq!(*out.get_pixel(11, 5), class_color(2));
        assert_eq!(out.get_pixel(30, 40).0, [0, 0, 0]);
    }
}
