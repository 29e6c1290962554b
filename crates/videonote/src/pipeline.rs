use std::fmt;
use std::sync::Arc;

use humansize::{format_size, DECIMAL};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::NoteConfig;
use crate::error::{ConversionError, TranscodeError};
use crate::fetch::Fetcher;
use crate::notify::{Notifier, RequestContext};
use crate::transcode::{stderr_tail, CropGeometry, Transcoder};
use crate::workspace::Workspace;

const STDERR_LOG_LINES: usize = 20;

/// One inbound clip, as declared by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    /// Opaque remote file handle
    pub file_handle: String,
    pub width: u32,
    pub height: u32,
    pub duration_secs: u64,
    pub size_bytes: u64,
}

impl ConversionRequest {
    pub fn geometry(&self) -> CropGeometry {
        CropGeometry::for_frame(self.width, self.height)
    }
}

/// A finished video note
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoNote {
    pub bytes: Vec<u8>,
    /// Display diameter reported on delivery: the source's shorter side
    pub length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    TooLarge,
    FetchFailed,
    TranscodeFailed,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::TooLarge => "too large",
            FailureKind::FetchFailed => "fetch failed",
            FailureKind::TranscodeFailed => "transcode failed",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a single conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Validating,
    Fetching,
    Transcoding,
    Succeeded,
    Failed(FailureKind),
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Succeeded | Stage::Failed(_))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Validating => f.write_str("validating"),
            Stage::Fetching => f.write_str("fetching"),
            Stage::Transcoding => f.write_str("transcoding"),
            Stage::Succeeded => f.write_str("succeeded"),
            Stage::Failed(kind) => write!(f, "failed ({})", kind),
        }
    }
}

/// Runs conversions. Holds no per-request state, so one instance (or cheap
/// clones of it) can serve any number of concurrent requests.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<NoteConfig>,
    fetcher: Fetcher,
    transcoder: Arc<dyn Transcoder>,
    notifier: Arc<dyn Notifier>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<NoteConfig>,
        fetcher: Fetcher,
        transcoder: Arc<dyn Transcoder>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            fetcher,
            transcoder,
            notifier,
        }
    }

    /// Run one request through its whole lifecycle, talking to the user via
    /// the notifier, and return the terminal stage.
    ///
    /// The processing notice goes out after validation and before any I/O,
    /// and is retracted before the result (or the error notice) is sent.
    pub async fn handle(
        &self,
        ctx: &RequestContext,
        request: &ConversionRequest,
        cancel: &CancellationToken,
    ) -> Stage {
        let clip = request.file_handle.as_str();
        info!(
            "Clip {}: received {}x{}, {}s, {}",
            clip,
            request.width,
            request.height,
            request.duration_secs,
            format_size(request.size_bytes, DECIMAL)
        );

        if let Err(err) = self.validate(request) {
            info!("Clip {}: rejected, {}", clip, err);
            if let Err(e) = self.notifier.notify_too_large(ctx).await {
                error!("Clip {}: failed to send too-large notice: {:#}", clip, e);
            }
            return Stage::Failed(err.kind());
        }

        let notice = match self.notifier.notify_processing(ctx).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Clip {}: failed to send processing notice: {:#}", clip, e);
                None
            }
        };

        let outcome = self.run_stages(request, cancel).await;

        if let Some(handle) = notice {
            if let Err(e) = self.notifier.retract_notice(ctx, handle).await {
                warn!("Clip {}: failed to retract processing notice: {:#}", clip, e);
            }
        }

        match outcome {
            Ok(note) => {
                if let Err(e) = self.notifier.deliver_artifact(ctx, &note).await {
                    error!("Clip {}: failed to deliver video note: {:#}", clip, e);
                    self.send_error_notice(ctx, clip).await;
                }
                self.enter(clip, Stage::Succeeded);
                Stage::Succeeded
            }
            Err(err) => {
                log_failure(clip, &err);
                self.send_error_notice(ctx, clip).await;
                let stage = Stage::Failed(err.kind());
                self.enter(clip, stage);
                stage
            }
        }
    }

    /// Convert without any user interaction
    pub async fn convert(
        &self,
        request: &ConversionRequest,
        cancel: &CancellationToken,
    ) -> Result<VideoNote, ConversionError> {
        self.validate(request)?;
        self.run_stages(request, cancel).await
    }

    fn validate(&self, request: &ConversionRequest) -> Result<(), ConversionError> {
        self.enter(&request.file_handle, Stage::Validating);
        let limits = self.config.limits;
        if limits.validate(request.duration_secs, request.size_bytes) {
            Ok(())
        } else {
            Err(ConversionError::TooLarge {
                duration_secs: request.duration_secs,
                size_bytes: request.size_bytes,
                limits,
            })
        }
    }

    /// Fetch, then transcode inside a fresh workspace. The workspace is
    /// released exactly once on every path out of the transcoding stage; a
    /// cleanup failure is logged and never replaces the stage's own result.
    async fn run_stages(
        &self,
        request: &ConversionRequest,
        cancel: &CancellationToken,
    ) -> Result<VideoNote, ConversionError> {
        let clip = request.file_handle.as_str();

        self.enter(clip, Stage::Fetching);
        let data = self.fetcher.fetch(clip, cancel).await?;
        info!("Clip {}: fetched {}", clip, format_size(data.len(), DECIMAL));

        self.enter(clip, Stage::Transcoding);
        let mut workspace = Workspace::acquire(&self.config.work_dir).await?;
        let geometry = request.geometry();
        let result = self.transcode_in(&workspace, &data, &geometry, cancel).await;
        if let Err(e) = workspace.release() {
            warn!("Clip {}: cleanup failed: {}", clip, e);
        }

        let bytes = result?;
        info!(
            "Clip {}: ✅ video note ready, {} (crop {} at {},{})",
            clip,
            format_size(bytes.len(), DECIMAL),
            geometry.side,
            geometry.x,
            geometry.y
        );
        Ok(VideoNote {
            bytes,
            length: geometry.side,
        })
    }

    async fn transcode_in(
        &self,
        workspace: &Workspace,
        data: &[u8],
        geometry: &CropGeometry,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TranscodeError> {
        let input = workspace.input_path();
        let output = workspace.output_path();

        tokio::fs::write(input, data)
            .await
            .map_err(|source| TranscodeError::WriteInput {
                path: input.to_path_buf(),
                source,
            })?;

        self.transcoder.transcode(input, output, geometry, cancel).await?;

        let bytes = tokio::fs::read(output)
            .await
            .map_err(|source| TranscodeError::ReadOutput {
                path: output.to_path_buf(),
                source,
            })?;
        if bytes.is_empty() {
            return Err(TranscodeError::EmptyOutput {
                path: output.to_path_buf(),
            });
        }
        Ok(bytes)
    }

    async fn send_error_notice(&self, ctx: &RequestContext, clip: &str) {
        if let Err(e) = self.notifier.notify_error(ctx).await {
            error!("Clip {}: failed to send error notice: {:#}", clip, e);
        }
    }

    fn enter(&self, clip: &str, stage: Stage) {
        debug!("Clip {}: {}", clip, stage);
    }
}

fn log_failure(clip: &str, err: &ConversionError) {
    match err {
        ConversionError::TranscodeFailed(TranscodeError::EngineFailed { stderr, .. }) => {
            error!(
                "Clip {}: ❌ {}\nFFmpeg stderr (tail):\n{}",
                clip,
                err,
                stderr_tail(stderr, STDERR_LOG_LINES)
            );
        }
        ConversionError::Cancelled { .. } => warn!("Clip {}: {}", clip, err),
        _ => error!("Clip {}: ❌ {}", clip, err),
    }
}
