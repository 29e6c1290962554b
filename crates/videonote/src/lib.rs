pub mod config;
pub mod error;
pub mod fetch;
pub mod limits;
pub mod messages;
pub mod notify;
pub mod pipeline;
pub mod transcode;
pub mod workspace;

pub use config::NoteConfig;
pub use error::{ConversionError, FetchError, TranscodeError, WorkspaceError};
pub use fetch::{BotApiResolver, DirectUrlResolver, Fetcher, UrlResolver};
pub use limits::Limits;
pub use messages::{Locale, MessageKey};
pub use notify::{NoticeHandle, Notifier, RequestContext};
pub use pipeline::{ConversionRequest, FailureKind, Orchestrator, Stage, VideoNote};
pub use transcode::{CropGeometry, FfmpegTranscoder, TranscodeProfile, Transcoder};
pub use workspace::Workspace;
