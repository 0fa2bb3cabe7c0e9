//! Shared test harness: an app wired to a fake model and a temp session root.

#![allow(dead_code)]

use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, Response, header},
};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use segserver::api::{AppState, create_router};
use segserver::config::AppConfig;
use segserver::imaging::{LabelMap, VolumeImage};
use segserver::pipeline::{PipelineError, SegmentationPipeline, SegmentationRequest, Task};
use segserver::session::SessionStore;

pub const BOUNDARY: &str = "segserver-test-boundary";

/// Label tables the fake model attaches, per task.
pub fn labels_for(task: Task) -> LabelMap {
    let names: &[(u32, &str)] = match task {
        Task::Total => &[(1, "spleen"), (2, "kidney_right"), (3, "kidney_left"), (5, "liver")],
        Task::TotalMr => &[(1, "spleen"), (2, "kidney_right"), (3, "kidney_left"), (4, "gallbladder")],
    };
    names
        .iter()
        .map(|(id, name)| (*id, name.to_string()))
        .collect()
}

/// Stand-in for the segmentation model.
#[derive(Default)]
pub struct FakePipeline {
    tasks: Mutex<Vec<Task>>,
    fail: bool,
    gate: Option<Arc<Semaphore>>,
}

impl FakePipeline {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Runs block until `release` is called.
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.lock().unwrap().clone()
    }
}

#[async_trait]
impl SegmentationPipeline for FakePipeline {
    async fn run(
        &self,
        input: &VolumeImage,
        request: &SegmentationRequest,
    ) -> Result<VolumeImage, PipelineError> {
        self.tasks.lock().unwrap().push(request.task);

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| PipelineError::Aborted(e.to_string()))?
                .forget();
        }

        if self.fail {
            return Err(PipelineError::Failed {
                status: "exit status: 1".to_string(),
                stderr: "RuntimeError in /opt/models/secret/weights.pth".to_string(),
            });
        }

        Ok(input.with_label_map(&labels_for(request.task))?)
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub pipeline: Arc<FakePipeline>,
    pub tmp: TempDir,
}

impl TestApp {
    pub fn session_dirs(&self) -> usize {
        std::fs::read_dir(self.state.sessions.root())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        use tower::ServiceExt;
        self.router.clone().oneshot(request).await.unwrap()
    }
}

/// Build an app with default settings and a working fake model.
pub async fn test_app() -> TestApp {
    test_app_with(FakePipeline::default(), |_| {}).await
}

/// Build an app around `pipeline`, letting the caller adjust config.
pub async fn test_app_with(
    pipeline: FakePipeline,
    configure: impl FnOnce(&mut AppConfig),
) -> TestApp {
    let tmp = TempDir::new().unwrap();

    let example = tmp.path().join("mri.nii.gz");
    std::fs::write(&example, gzip(&nifti_volume(&[0, 1, 1, 2, 2, 3, 3, 4, 4, 5]))).unwrap();

    let mut config = AppConfig::default();
    config.storage.root = Some(tmp.path().join("sessions"));
    config.example.path = example;
    config.download.token_secret = Some("integration-test-secret".to_string());
    configure(&mut config);

    let sessions = Arc::new(SessionStore::open(&config.storage).await.unwrap());
    let pipeline = Arc::new(pipeline);
    let state = AppState::new(config, sessions, pipeline.clone());
    let router = create_router(state.clone());

    TestApp {
        router,
        state,
        pipeline,
        tmp,
    }
}

/// Little-endian uint8 NIfTI-1 volume, one row of `voxels`.
pub fn nifti_volume(voxels: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; 348];
    bytes[0..4].copy_from_slice(&348i32.to_le_bytes());
    let dim: [i16; 8] = [3, voxels.len() as i16, 1, 1, 1, 1, 1, 1];
    for (i, d) in dim.iter().enumerate() {
        bytes[40 + i * 2..42 + i * 2].copy_from_slice(&d.to_le_bytes());
    }
    bytes[70..72].copy_from_slice(&2i16.to_le_bytes());
    bytes[72..74].copy_from_slice(&8i16.to_le_bytes());
    for i in 0..8 {
        bytes[76 + i * 4..80 + i * 4].copy_from_slice(&1.0f32.to_le_bytes());
    }
    bytes[108..112].copy_from_slice(&352.0f32.to_le_bytes());
    bytes[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    bytes[344..348].copy_from_slice(b"n+1\0");
    bytes.extend_from_slice(&[0, 0, 0, 0]);
    bytes.extend_from_slice(voxels);
    bytes
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

/// Multipart form with an optional `file` part and optional `image_type`.
pub fn multipart_body(file: Option<&[u8]>, image_type: Option<&str>) -> Vec<u8> {
    let mut body = Vec::new();
    if let Some(image_type) = image_type {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image_type\"\r\n\r\n{image_type}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some(file) = file {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"scan.nii.gz\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(file);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn segment_request(file: Option<&[u8]>, image_type: Option<&str>) -> Request<Body> {
    Request::builder()
        .uri("/segment/")
        .method(Method::POST)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(file, image_type)))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(Method::GET)
        .body(Body::empty())
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), 16 * 1024 * 1024)
        .await
        .unwrap()
        .to_vec()
}

pub async fn json_body(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
