//! Per-format annotation writers (annotations phase): COCO JSON and
//! YOLO per-image `.txt` output over the same polygon data.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use serde_json::json;

use seg_core::{AppError, AppResult, ImageId};
use seg_store::entities::Polygon;

pub struct AnnotatedImage {
    pub image_id: ImageId,
    pub file_name: String,
    pub width: u32,
    pub height: u32,
    pub polygons: Vec<Polygon>,
}

#[derive(Serialize)]
struct CocoImage {
    id: u64,
    file_name: String,
    width: u32,
    height: u32,
}

#[derive(Serialize)]
struct CocoAnnotation {
    id: u64,
    image_id: u64,
    category_id: u32,
    segmentation: Vec<Vec<f64>>,
    area: f64,
    bbox: [f64; 4],
    iscrowd: u8,
}

#[derive(Serialize)]
struct CocoCategory {
    id: u32,
    name: String,
}

#[derive(Serialize)]
struct CocoDocument {
    images: Vec<CocoImage>,
    annotations: Vec<CocoAnnotation>,
    categories: Vec<CocoCategory>,
}

fn flatten_points(points: &[(f64, f64)]) -> Vec<f64> {
    points.iter().flat_map(|&(x, y)| [x, y]).collect()
}

fn bounding_box(points: &[(f64, f64)]) -> [f64; 4] {
    let xs = points.iter().map(|p| p.0);
    let ys = points.iter().map(|p| p.1);
    let min_x = xs.clone().fold(f64::MAX, f64::min);
    let max_x = xs.fold(f64::MIN, f64::max);
    let min_y = ys.clone().fold(f64::MAX, f64::min);
    let max_y = ys.fold(f64::MIN, f64::max);
    [min_x, min_y, max_x - min_x, max_y - min_y]
}

fn shoelace_area(points: &[(f64, f64)]) -> f64 {
    let mut sum = 0.0;
    for i in 0..points.len() {
        let (x1, y1) = points[i];
        let (x2, y2) = points[(i + 1) % points.len()];
        sum += x1 * y2 - x2 * y1;
    }
    (sum / 2.0).abs()
}

/// Writes one COCO JSON for the whole job: `images`/`annotations`/
/// `categories` arrays, external and internal polygons both recorded
/// as separate categories so holes survive round-trip.
pub fn write_coco(images: &[AnnotatedImage], path: &Path) -> AppResult<()> {
    let categories = vec![
        CocoCategory { id: 1, name: "external".into() },
        CocoCategory { id: 2, name: "internal".into() },
    ];
    let mut coco_images = Vec::new();
    let mut coco_annotations = Vec::new();
    let mut annotation_id = 1u64;

    for (image_index, image) in images.iter().enumerate() {
        let numeric_id = image_index as u64 + 1;
        coco_images.push(CocoImage {
            id: numeric_id,
            file_name: image.file_name.clone(),
            width: image.width,
            height: image.height,
        });
        for polygon in &image.polygons {
            if polygon.points.len() < 3 {
                continue;
            }
            coco_annotations.push(CocoAnnotation {
                id: annotation_id,
                image_id: numeric_id,
                category_id: if polygon.is_internal { 2 } else { 1 },
                segmentation: vec![flatten_points(&polygon.points)],
                area: shoelace_area(&polygon.points),
                bbox: bounding_box(&polygon.points),
                iscrowd: 0,
            });
            annotation_id += 1;
        }
    }

    let document = CocoDocument { images: coco_images, annotations: coco_annotations, categories };
    let bytes = serde_json::to_vec_pretty(&document)
        .map_err(|e| AppError::Internal(format!("failed to serialize coco document: {e}")))?;
    std::fs::write(path, bytes).map_err(|e| AppError::Internal(format!("failed to write coco document: {e}")))?;
    Ok(())
}

/// Writes one `.txt` per image: `class cx cy w h` normalized to
/// [0,1] bounding-box center/extent, the standard YOLO detection line.
/// Polygon shape beyond the bounding box is not representable in this
/// format: each line is per-box, not per-vertex.
pub fn write_yolo(images: &[AnnotatedImage], dir: &Path) -> AppResult<()> {
    std::fs::create_dir_all(dir).map_err(|e| AppError::Internal(format!("failed to create yolo directory: {e}")))?;
    for image in images {
        let stem = Path::new(&image.file_name).file_stem().and_then(|s| s.to_str()).unwrap_or("image");
        let mut lines = Vec::new();
        for polygon in &image.polygons {
            if polygon.points.len() < 3 {
                continue;
            }
            let [x, y, w, h] = bounding_box(&polygon.points);
            let class = if polygon.is_internal { 1 } else { 0 };
            let cx = (x + w / 2.0) / image.width as f64;
            let cy = (y + h / 2.0) / image.height as f64;
            let nw = w / image.width as f64;
            let nh = h / image.height as f64;
            lines.push(format!("{class} {cx:.6} {cy:.6} {nw:.6} {nh:.6}"));
        }
        let path = dir.join(format!("{stem}.txt"));
        std::fs::write(&path, lines.join("\n"))
            .map_err(|e| AppError::Internal(format!("failed to write yolo annotation: {e}")))?;
    }
    Ok(())
}

/// The native polygon dump: one JSON file mapping image id to its
/// polygon list, coordinates in original-image pixel space (§4.3).
pub fn write_native_json(images: &[AnnotatedImage], path: &Path) -> AppResult<()> {
    let mut map: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    for image in images {
        map.insert(
            image.image_id.as_uuid().to_string(),
            json!({
                "fileName": image.file_name,
                "width": image.width,
                "height": image.height,
                "polygons": image.polygons,
            }),
        );
    }
    let bytes = serde_json::to_vec_pretty(&map)
        .map_err(|e| AppError::Internal(format!("failed to serialize native annotation dump: {e}")))?;
    std::fs::write(path, bytes).map_err(|e| AppError::Internal(format!("failed to write native annotation dump: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image() -> AnnotatedImage {
        AnnotatedImage {
            image_id: ImageId::new(),
            file_name: "specimen.png".into(),
            width: 100,
            height: 100,
            polygons: vec![Polygon { points: vec![(10.0, 10.0), (50.0, 10.0), (50.0, 50.0), (10.0, 50.0)], is_internal: false }],
        }
    }

    #[test]
    fn coco_writer_produces_one_annotation_per_polygon() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coco.json");
        write_coco(&[sample_image()], &path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(value["annotations"].as_array().unwrap().len(), 1);
        assert_eq!(value["images"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn yolo_writer_normalizes_bbox_into_unit_range() {
        let dir = tempfile::tempdir().unwrap();
        write_yolo(&[sample_image()], dir.path()).unwrap();
        let contents = std::fs::read_to_string(dir.path().join("specimen.txt")).unwrap();
        let fields: Vec<f64> = contents.split_whitespace().skip(1).map(|s| s.parse().unwrap()).collect();
        assert!(fields.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn native_json_keys_by_image_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("native.json");
        let image = sample_image();
        let id = image.image_id.as_uuid().to_string();
        write_native_json(&[image], &path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(value.get(&id).is_some());
    }
}
