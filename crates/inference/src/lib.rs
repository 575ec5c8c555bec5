//! Thin, retrying client to the external ML service (§2 / §6
//! `ML_SERVICE_URL`). Behind a narrow `async_trait` interface with a
//! production and an in-memory/test variant, per §9
//! "Polymorphism" — grounded on `notify/dispatcher.rs`'s `Notifier`
//! trait + `MockNotifier` test double pattern.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub model: String,
    pub image_path: String,
    pub threshold: f32,
    pub detect_holes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceStage {
    Preprocessing,
    Inference,
    Postprocessing,
    Saving,
}

impl InferenceStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            InferenceStage::Preprocessing => "preprocessing",
            InferenceStage::Inference => "inference",
            InferenceStage::Postprocessing => "postprocessing",
            InferenceStage::Saving => "saving",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceProgress {
    pub stage: InferenceStage,
    /// Monotonically non-decreasing within one run, per §4.2.
    pub progress: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResult {
    pub polygons: Vec<InferencePolygon>,
    pub processing_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferencePolygon {
    pub points: Vec<(f64, f64)>,
    pub is_internal: bool,
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference request invalid: {0}")]
    InvalidInput(String),
    #[error("inference backend unavailable: {0}")]
    Transient(String),
    #[error("inference backend error: {0}")]
    Internal(String),
    #[error("inference exceeded its timeout budget")]
    TimedOut,
}

impl From<InferenceError> for seg_core::AppError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::InvalidInput(m) => seg_core::AppError::InvalidInput(m),
            InferenceError::Transient(m) => seg_core::AppError::Transient(m),
            InferenceError::TimedOut => seg_core::AppError::Transient("inference timed out".into()),
            InferenceError::Internal(m) => seg_core::AppError::Internal(m),
        }
    }
}

/// Capability interface the QueueEngine depends on. `cancel` is accepted
/// for forward compatibility only — this implementation does not race it
/// against the in-flight RPC; only pre-dispatch and post-completion
/// conditional writes enforce cancellation today.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn run(
        &self,
        request: InferenceRequest,
        progress: mpsc::Sender<InferenceProgress>,
        cancel: CancellationToken,
    ) -> Result<InferenceResult, InferenceError>;
}

/// Production client: retrying `reqwest` calls to `ML_SERVICE_URL`, a
/// hard 10-minute timeout per §5.
pub struct HttpInferenceClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpInferenceClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder().timeout(timeout).build().unwrap_or_default(),
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn run(
        &self,
        request: InferenceRequest,
        progress: mpsc::Sender<InferenceProgress>,
        _cancel: CancellationToken,
    ) -> Result<InferenceResult, InferenceError> {
        let _ = progress
            .send(InferenceProgress { stage: InferenceStage::Preprocessing, progress: 0.0 })
            .await;

        let url = format!("{}/segment", self.base_url.trim_end_matches('/'));
        let fut = self.http.post(&url).json(&request).send();

        let response = match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) if e.is_timeout() || e.is_connect() => {
                return Err(InferenceError::Transient(e.to_string()))
            }
            Ok(Err(e)) => return Err(InferenceError::Internal(e.to_string())),
            Err(_) => return Err(InferenceError::TimedOut),
        };

        let _ = progress
            .send(InferenceProgress { stage: InferenceStage::Inference, progress: 0.5 })
            .await;

        if !response.status().is_success() {
            let status = response.status();
            return if status.is_client_error() {
                Err(InferenceError::InvalidInput(format!("ML service rejected request: {status}")))
            } else {
                Err(InferenceError::Transient(format!("ML service returned {status}")))
            };
        }

        let result: InferenceResult = response
            .json()
            .await
            .map_err(|e| InferenceError::Internal(format!("decoding response: {e}")))?;

        let _ = progress
            .send(InferenceProgress { stage: InferenceStage::Postprocessing, progress: 0.8 })
            .await;
        let _ = progress.send(InferenceProgress { stage: InferenceStage::Saving, progress: 0.95 }).await;

        Ok(result)
    }
}

/// In-memory test double. Returns a canned result or error without any
/// network traffic.
pub struct InMemoryInferenceClient {
    pub outcome: InMemoryOutcome,
}

pub enum InMemoryOutcome {
    Success(InferenceResult),
    Fail(InferenceError),
}

#[async_trait]
impl InferenceClient for InMemoryInferenceClient {
    async fn run(
        &self,
        _request: InferenceRequest,
        progress: mpsc::Sender<InferenceProgress>,
        _cancel: CancellationToken,
    ) -> Result<InferenceResult, InferenceError> {
        for stage in [
            InferenceStage::Preprocessing,
            InferenceStage::Inference,
            InferenceStage::Postprocessing,
            InferenceStage::Saving,
        ] {
            let _ = progress.send(InferenceProgress { stage, progress: 1.0 }).await;
        }
        match &self.outcome {
            InMemoryOutcome::Success(result) => Ok(result.clone()),
            InMemoryOutcome::Fail(InferenceError::Transient(m)) => {
                Err(InferenceError::Transient(m.clone()))
            }
            InMemoryOutcome::Fail(InferenceError::InvalidInput(m)) => {
                Err(InferenceError::InvalidInput(m.clone()))
            }
            InMemoryOutcome::Fail(InferenceError::Internal(m)) => Err(InferenceError::Internal(m.clone())),
            InMemoryOutcome::Fail(InferenceError::TimedOut) => Err(InferenceError::TimedOut),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_client_reports_all_four_stages_in_order() {
        let client = InMemoryInferenceClient {
            outcome: InMemoryOutcome::Success(InferenceResult { polygons: vec![], processing_duration_ms: 10 }),
        };
        let (tx, mut rx) = mpsc::channel(8);
        client
            .run(
                InferenceRequest { model: "m".into(), image_path: "p".into(), threshold: 0.5, detect_holes: true },
                tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut stages = Vec::new();
        while let Ok(p) = rx.try_recv() {
            stages.push(p.stage);
        }
        assert_eq!(
            stages,
            vec![
                InferenceStage::Preprocessing,
                InferenceStage::Inference,
                InferenceStage::Postprocessing,
                InferenceStage::Saving
            ]
        );
    }

    #[tokio::test]
    async fn in_memory_client_surfaces_transient_failure() {
        let client = InMemoryInferenceClient {
            outcome: InMemoryOutcome::Fail(InferenceError::Transient("backend down".into())),
        };
        let (tx, _rx) = mpsc::channel(8);
        let err = client
            .run(
                InferenceRequest { model: "m".into(), image_path: "p".into(), threshold: 0.5, detect_holes: true },
                tx,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Transient(_)));
        let app_err: seg_core::AppError = err.into();
        assert!(app_err.retryable());
    }
}
