//! JSON contract tests for the REST DTOs (§6). Grounded on
//! `tests/villa_suggest_integration.rs`'s serialization-roundtrip style,
//! simplified since this crate exposes a lib target the DTOs can be
//! imported from directly rather than needing mirror types.

use seg_server::api::segmentation::EnqueueBatchRequest;

#[test]
fn enqueue_batch_request_defaults() {
    let image_id = seg_core::ImageId::new();
    let body = serde_json::json!({ "imageIds": [image_id.to_string()] });
    let req: EnqueueBatchRequest = serde_json::from_value(body).unwrap();
    assert_eq!(req.image_ids, vec![image_id]);
    assert_eq!(req.model, "default");
    assert_eq!(req.threshold, 0.5);
    assert!(!req.detect_holes);
}

#[test]
fn enqueue_batch_request_overrides() {
    let image_id = seg_core::ImageId::new();
    let body = serde_json::json!({
        "imageIds": [image_id.to_string()],
        "model": "high-res",
        "threshold": 0.8,
        "detectHoles": true,
    });
    let req: EnqueueBatchRequest = serde_json::from_value(body).unwrap();
    assert_eq!(req.model, "high-res");
    assert_eq!(req.threshold, 0.8);
    assert!(req.detect_holes);
}

#[test]
fn enqueue_batch_request_requires_image_ids() {
    let body = serde_json::json!({});
    let req: Result<EnqueueBatchRequest, _> = serde_json::from_value(body);
    assert!(req.is_err(), "imageIds is required with no default");
}
