//! One segmentation request, end to end.
//!
//! `create session -> decode input -> run model -> save result -> read label
//! table`. Any failure removes the session directory before the error is
//! returned; a dropped request (client gone) removes it in the background,
//! once the blocking file work it started has finished.

mod error;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::imaging::{self, DEFAULT_MAX_DECODED_SIZE, LabelMap, VolumeImage};
use crate::pipeline::{
    Admission, PipelineError, QueueStats, SegmentationPipeline, SegmentationQueue,
    SegmentationRequest, Task,
};
use crate::session::{Session, SessionId, SessionStore};

pub use error::SegmentError;

/// Held by blocking file work on a session; cleanup waits for it.
type WorkLock = Arc<Mutex<()>>;

/// Where the scan comes from.
#[derive(Debug, Clone)]
pub enum InputSource {
    /// Bytes uploaded by a client.
    Upload(Bytes),
    /// A file already on the server.
    File(PathBuf),
}

/// A finished segmentation whose result is on disk.
#[derive(Debug, Clone)]
pub struct SegmentationOutcome {
    pub session_id: SessionId,
    pub task: Task,
    pub segmentation_type: &'static str,
    pub label_map: LabelMap,
    pub output_path: PathBuf,
}

/// Runs segmentation requests against a pipeline.
#[derive(Clone)]
pub struct SegmentationService {
    sessions: Arc<SessionStore>,
    pipeline: Arc<dyn SegmentationPipeline>,
    queue: SegmentationQueue,
    fast: bool,
    timeout: Duration,
    max_decoded_size: u64,
}

impl SegmentationService {
    pub fn new(
        sessions: Arc<SessionStore>,
        pipeline: Arc<dyn SegmentationPipeline>,
        queue: SegmentationQueue,
        fast: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            pipeline,
            queue,
            fast,
            timeout,
            max_decoded_size: DEFAULT_MAX_DECODED_SIZE,
        }
    }

    /// Cap on an upload's uncompressed size.
    pub fn with_max_decoded_size(mut self, max_decoded_size: u64) -> Self {
        self.max_decoded_size = max_decoded_size;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Segment `source` with `task` in a fresh session.
    pub async fn segment(
        &self,
        source: InputSource,
        task: Task,
    ) -> Result<SegmentationOutcome, SegmentError> {
        let admission = self.queue.try_admit().map_err(|_| SegmentError::Busy)?;

        // The guard exists before the directory does, so no drop point leaks it.
        let id = SessionId::new();
        let work = WorkLock::default();
        let mut guard = CleanupGuard::new(self.sessions.clone(), id, work.clone());
        let sessions = self.sessions.clone();
        let session = match blocking(&work, move || sessions.create_session_blocking(id)).await {
            Ok(session) => session,
            Err(err) => {
                guard.disarm();
                return Err(err);
            }
        };
        let span = info_span!("segment", session_id = %session.id, task = %task);

        let result = self
            .process(&admission, &session, &work, source, task)
            .instrument(span)
            .await;

        match result {
            Ok(outcome) => {
                self.sessions.mark_pending(&session.id)?;
                guard.disarm();
                info!(session_id = %session.id, labels = outcome.label_map.len(), "Segmentation finished");
                Ok(outcome)
            }
            Err(err) => {
                guard.disarm();
                if let Err(e) = self.sessions.delete_session(&session.id).await {
                    warn!(session_id = %session.id, "Failed to clean up session: {}", e);
                }
                Err(err)
            }
        }
    }

    async fn process(
        &self,
        admission: &Admission,
        session: &Session,
        work: &WorkLock,
        source: InputSource,
        task: Task,
    ) -> Result<SegmentationOutcome, SegmentError> {
        let input = match source {
            InputSource::Upload(bytes) => {
                let input_path = self.sessions.input_path(&session.id);
                let max_decoded_size = self.max_decoded_size;
                blocking(work, move || {
                    let image = VolumeImage::decode_bounded(bytes.to_vec(), max_decoded_size)?;
                    imaging::save_as(image, &input_path)
                })
                .await?
            }
            InputSource::File(path) => blocking(work, move || imaging::load(&path)).await?,
        };
        debug!(
            "Input volume {:?}, spacing {:?}",
            input.dims().unwrap_or_default(),
            input.spacing().unwrap_or_default()
        );

        let request = SegmentationRequest {
            task,
            fast: self.fast,
            work_dir: session.dir.clone(),
        };
        let segmented = admission
            .run(self.timeout, self.pipeline.run(&input, &request))
            .await?;

        let output_path = self.sessions.output_path(&session.id);
        let save_path = output_path.clone();
        blocking(work, move || imaging::save(&segmented, &save_path)).await?;

        // Read back what was written so the label table matches the file.
        let load_path = output_path.clone();
        let (image, label_map) = blocking(work, move || imaging::load_multilabel(&load_path))
            .await
            .map_err(|err| match err {
                SegmentError::Decode(codec) => {
                    SegmentError::Pipeline(PipelineError::Output(codec))
                }
                other => other,
            })?;

        Ok(SegmentationOutcome {
            session_id: session.id,
            task,
            segmentation_type: image.type_name(),
            label_map,
            output_path,
        })
    }
}

/// Run `job` on the blocking pool. The job holds `work` until it returns,
/// even when the awaiting request is dropped first.
async fn blocking<T, E, F>(work: &WorkLock, job: F) -> Result<T, SegmentError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    SegmentError: From<E>,
{
    let held = work.clone().lock_owned().await;
    tokio::task::spawn_blocking(move || {
        let _held = held;
        job()
    })
    .await
    .map_err(|e| SegmentError::Internal(e.to_string()))?
    .map_err(SegmentError::from)
}

/// Removes a session whose request was dropped before finishing.
struct CleanupGuard {
    sessions: Arc<SessionStore>,
    id: SessionId,
    work: WorkLock,
    armed: bool,
}

impl CleanupGuard {
    fn new(sessions: Arc<SessionStore>, id: SessionId, work: WorkLock) -> Self {
        Self {
            sessions,
            id,
            work,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let sessions = self.sessions.clone();
        let id = self.id;
        let work = self.work.clone();
        warn!(session_id = %id, "Segmentation request dropped; removing session");
        handle.spawn(async move {
            // A detached blocking job may still be writing into the directory.
            let _idle = work.lock_owned().await;
            if let Err(e) = sessions.delete_session(&id).await {
                warn!(session_id = %id, "Failed to clean up dropped session: {}", e);
            }
        });
    }
}
