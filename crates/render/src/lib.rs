//! Rasterizes polygon overlays and numbered labels onto images
//! (§4.6). Grounded on `storage/cache.rs`'s `SegmentCache` — same
//! `Mutex<LruCache<K, V>>` shape, same bounded-eviction discipline,
//! applied here to digit glyph paths instead of downloaded segments.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;

use image::{ImageBuffer, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_polygon_mut, draw_polygon_mut};
use imageproc::point::Point;
use imageproc::rect::Rect;
use lru::LruCache;
use thiserror::Error;

const GLYPH_CACHE_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to read source image: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("polygon has fewer than 3 points")]
    DegeneratePolygon,
}

impl From<RenderError> for seg_core::AppError {
    fn from(err: RenderError) -> Self {
        seg_core::AppError::Internal(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct RgbColor(pub u8, pub u8, pub u8);

impl RgbColor {
    pub fn from_hex(hex: &str) -> Self {
        let h = hex.trim_start_matches('#');
        let r = u8::from_str_radix(&h[0..2], 16).unwrap_or(255);
        let g = u8::from_str_radix(&h[2..4], 16).unwrap_or(0);
        let b = u8::from_str_radix(&h[4..6], 16).unwrap_or(0);
        Self(r, g, b)
    }

    fn to_rgba(&self, alpha: f32) -> Rgba<u8> {
        Rgba([self.0, self.1, self.2, (alpha.clamp(0.0, 1.0) * 255.0) as u8])
    }
}

#[derive(Debug, Clone)]
pub struct RenderPolygon {
    pub points: Vec<(f64, f64)>,
    pub is_internal: bool,
    pub label: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub show_numbers: bool,
    pub external_color: RgbColor,
    pub internal_color: RgbColor,
    pub stroke_width: u8,
    pub font_size: u8,
    pub transparency: f32,
}

/// Cache key for the precomputed digit path cache (§4.6): `(digit, size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GlyphKey {
    digit: char,
    size_px: u32,
}

/// A digit rendered as a small set of filled segments (seven-segment
/// display layout) in a local coordinate space with origin at the
/// glyph's top-left corner. Precomputing this per `(digit, size)` and
/// caching it is what §4.6 calls "a precomputed path cache keyed by
/// (digit, size)".
#[derive(Debug, Clone)]
struct DigitGlyph {
    segments: Vec<Rect>,
    width: i32,
    height: i32,
}

/// Which of the seven LCD-style segments are lit for each digit 0-9.
/// Order: top, top-left, top-right, middle, bottom-left, bottom-right, bottom.
const SEGMENTS: [[bool; 7]; 10] = [
    [true, true, true, false, true, true, true],    // 0
    [false, false, true, false, false, true, false], // 1
    [true, false, true, true, true, false, true],    // 2
    [true, false, true, true, false, true, true],    // 3
    [false, true, true, true, false, true, false],   // 4
    [true, true, false, true, false, true, true],    // 5
    [true, true, false, true, true, true, true],     // 6
    [true, false, true, false, false, true, false],  // 7
    [true, true, true, true, true, true, true],       // 8
    [true, true, true, true, false, true, true],      // 9
];

fn build_digit_glyph(digit: char, size_px: u32) -> Option<DigitGlyph> {
    let n = digit.to_digit(10)? as usize;
    let lit = SEGMENTS[n];
    let w = size_px.max(4) as i32;
    let h = (size_px as f64 * 1.6).round().max(6.0) as i32;
    let thickness = (w / 4).max(1);
    let mut segments = Vec::new();

    // top
    if lit[0] {
        segments.push(Rect::at(0, 0).of_size(w as u32, thickness as u32));
    }
    // top-left
    if lit[1] {
        segments.push(Rect::at(0, 0).of_size(thickness as u32, (h / 2) as u32));
    }
    // top-right
    if lit[2] {
        segments.push(Rect::at(w - thickness, 0).of_size(thickness as u32, (h / 2) as u32));
    }
    // middle
    if lit[3] {
        segments.push(Rect::at(0, h / 2 - thickness / 2).of_size(w as u32, thickness as u32));
    }
    // bottom-left
    if lit[4] {
        segments.push(Rect::at(0, h / 2).of_size(thickness as u32, (h / 2) as u32));
    }
    // bottom-right
    if lit[5] {
        segments.push(Rect::at(w - thickness, h / 2).of_size(thickness as u32, (h / 2) as u32));
    }
    // bottom
    if lit[6] {
        segments.push(Rect::at(0, h - thickness).of_size(w as u32, thickness as u32));
    }

    Some(DigitGlyph { segments, width: w, height: h })
}

pub struct RenderEngine {
    glyph_cache: Mutex<LruCache<GlyphKey, DigitGlyph>>,
}

impl Default for RenderEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderEngine {
    pub fn new() -> Self {
        Self { glyph_cache: Mutex::new(LruCache::new(NonZeroUsize::new(GLYPH_CACHE_CAPACITY).unwrap())) }
    }

    fn digit_glyph(&self, digit: char, size_px: u32) -> Option<DigitGlyph> {
        let key = GlyphKey { digit, size_px };
        {
            let mut cache = self.glyph_cache.lock().unwrap();
            if let Some(g) = cache.get(&key) {
                return Some(g.clone());
            }
        }
        let glyph = build_digit_glyph(digit, size_px)?;
        self.glyph_cache.lock().unwrap().put(key, glyph.clone());
        Some(glyph)
    }

    /// Rasterizes `polygons` over `source_path`, writing a single image to
    /// `output_path`. External rings are drawn first, then internal holes
    /// over them using the internal color, per §4.6.
    pub fn render_overlay(
        &self,
        source_path: &Path,
        polygons: &[RenderPolygon],
        options: &RenderOptions,
        output_path: &Path,
    ) -> Result<(), RenderError> {
        let mut canvas = image::open(source_path)?.to_rgba8();

        for polygon in polygons.iter().filter(|p| !p.is_internal) {
            self.draw_polygon(&mut canvas, polygon, &options.external_color, options)?;
        }
        for polygon in polygons.iter().filter(|p| p.is_internal) {
            self.draw_polygon(&mut canvas, polygon, &options.internal_color, options)?;
        }

        if options.show_numbers {
            for polygon in polygons.iter().filter(|p| p.label.is_some()) {
                self.draw_label(&mut canvas, polygon, options);
            }
        }

        canvas.save(output_path)?;
        Ok(())
    }

    fn draw_polygon(
        &self,
        canvas: &mut RgbaImage,
        polygon: &RenderPolygon,
        color: &RgbColor,
        options: &RenderOptions,
    ) -> Result<(), RenderError> {
        if polygon.points.len() < 3 {
            return Err(RenderError::DegeneratePolygon);
        }
        let points: Vec<Point<i32>> =
            polygon.points.iter().map(|&(x, y)| Point::new(x as i32, y as i32)).collect();

        draw_polygon_mut(canvas, &points, color.to_rgba(options.transparency));

        let hollow_points: Vec<Point<f32>> =
            polygon.points.iter().map(|&(x, y)| Point::new(x as f32, y as f32)).collect();

        let stroke = color.to_rgba(1.0);
        for _ in 0..options.stroke_width.max(1) {
            draw_hollow_polygon_mut(canvas, &hollow_points, stroke);
        }
        Ok(())
    }

    fn draw_label(&self, canvas: &mut RgbaImage, polygon: &RenderPolygon, options: &RenderOptions) {
        let Some(label) = polygon.label else { return };
        let Some((cx, cy)) = centroid(&polygon.points) else { return };

        let digits: Vec<char> = label.to_string().chars().collect();
        let glyphs: Vec<DigitGlyph> = digits
            .iter()
            .filter_map(|&d| self.digit_glyph(d, options.font_size as u32))
            .collect();
        let total_width: i32 = glyphs.iter().map(|g| g.width + 2).sum();
        let (w, h) = (canvas.width() as i32, canvas.height() as i32);
        let mut pen_x = (cx as i32 - total_width / 2).clamp(0, w - 1);
        let base_y = (cy as i32 - options.font_size as i32).clamp(0, h - 1);

        for glyph in &glyphs {
            for seg in &glyph.segments {
                let rect = Rect::at(pen_x + seg.left(), base_y + seg.top())
                    .of_size(seg.width(), seg.height());
                draw_filled_rect_mut(canvas, rect, Rgba([255, 255, 255, 235]));
            }
            pen_x += glyph.width + 2;
        }
    }

    /// Composites the overlay at source resolution, then downsamples with
    /// a high-quality filter for thumbnails, per §4.6.
    pub fn render_thumbnail(
        &self,
        source_path: &Path,
        polygons: &[RenderPolygon],
        options: &RenderOptions,
        max_dimension: u32,
        output_path: &Path,
    ) -> Result<(), RenderError> {
        let tmp = tempfile::Builder::new().suffix(".png").tempfile()?;
        self.render_overlay(source_path, polygons, options, tmp.path())?;
        let full = image::open(tmp.path())?;
        let (w, h) = (full.width(), full.height());
        let scale = (max_dimension as f64 / w.max(h) as f64).min(1.0);
        let (new_w, new_h) = ((w as f64 * scale) as u32, (h as f64 * scale) as u32);
        let thumb = full.resize(new_w.max(1), new_h.max(1), image::imageops::FilterType::Lanczos3);
        thumb.save(output_path)?;
        Ok(())
    }
}

fn centroid(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    if points.is_empty() {
        return None;
    }
    let (sum_x, sum_y) = points.iter().fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
    Some((sum_x / points.len() as f64, sum_y / points.len() as f64))
}

pub fn blank_canvas(width: u32, height: u32) -> RgbaImage {
    ImageBuffer::from_pixel(width, height, Rgba([255, 255, 255, 255]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_color_parses_hex() {
        let c = RgbColor::from_hex("#FF0000");
        assert_eq!((c.0, c.1, c.2), (255, 0, 0));
    }

    #[test]
    fn centroid_of_unit_square_is_its_center() {
        let points = vec![(0.0, 0.0), (2.0, 0.0), (2.0, 2.0), (0.0, 2.0)];
        let (cx, cy) = centroid(&points).unwrap();
        assert_eq!((cx, cy), (1.0, 1.0));
    }

    #[test]
    fn digit_glyphs_are_distinct_across_digits() {
        let zero = build_digit_glyph('0', 16).unwrap();
        let one = build_digit_glyph('1', 16).unwrap();
        assert_ne!(zero.segments.len(), one.segments.len());
    }

    #[test]
    fn non_digit_characters_have_no_glyph() {
        assert!(build_digit_glyph('x', 16).is_none());
    }

    #[test]
    fn glyph_cache_evicts_beyond_capacity() {
        let engine = RenderEngine::new();
        for i in 0..(GLYPH_CACHE_CAPACITY + 10) {
            let digit = std::char::from_digit((i % 10) as u32, 10).unwrap();
            engine.digit_glyph(digit, 10 + (i as u32 % 20));
        }
        assert!(engine.glyph_cache.lock().unwrap().len() <= GLYPH_CACHE_CAPACITY);
    }

    #[test]
    fn draw_polygon_rejects_degenerate_shape() {
        let engine = RenderEngine::new();
        let mut canvas = blank_canvas(10, 10);
        let polygon = RenderPolygon { points: vec![(0.0, 0.0), (1.0, 1.0)], is_internal: false, label: None };
        let options = RenderOptions {
            show_numbers: false,
            external_color: RgbColor::from_hex("#FF0000"),
            internal_color: RgbColor::from_hex("#0000FF"),
            stroke_width: 2,
            font_size: 16,
            transparency: 0.3,
        };
        let err = engine.draw_polygon(&mut canvas, &polygon, &options.external_color, &options).unwrap_err();
        assert!(matches!(err, RenderError::DegeneratePolygon));
    }
}
