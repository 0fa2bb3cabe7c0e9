//! Application state shared across handlers.

use std::sync::Arc;

use crate::auth::DownloadSigner;
use crate::config::AppConfig;
use crate::pipeline::{SegmentationPipeline, SegmentationQueue};
use crate::segmentation::SegmentationService;
use crate::session::SessionStore;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub sessions: Arc<SessionStore>,
    pub segmentation: SegmentationService,
    pub signer: Arc<DownloadSigner>,
}

impl AppState {
    /// Wire the service together around an already-open session store.
    pub fn new(
        config: AppConfig,
        sessions: Arc<SessionStore>,
        pipeline: Arc<dyn SegmentationPipeline>,
    ) -> Self {
        let queue = SegmentationQueue::new(
            config.pipeline.max_concurrent,
            config.pipeline.max_queued,
        );
        let segmentation = SegmentationService::new(
            sessions.clone(),
            pipeline,
            queue,
            config.pipeline.fast,
            config.pipeline.timeout(),
        )
        .with_max_decoded_size(config.server.max_decoded_size);
        let signer = Arc::new(DownloadSigner::from_config(&config.download));

        Self {
            config: Arc::new(config),
            sessions,
            segmentation,
            signer,
        }
    }
}
