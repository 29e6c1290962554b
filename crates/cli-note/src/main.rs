use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use videonote::{
    fetch::redact_token,
    messages::{self, Locale, MessageKey},
    workspace::sweep_orphans,
    BotApiResolver, ConversionRequest, DirectUrlResolver, Fetcher, FfmpegTranscoder, NoteConfig,
    NoticeHandle, Notifier, Orchestrator, RequestContext, Stage, UrlResolver, VideoNote,
};

const DEFAULT_SWEEP_AGE_SECS: u64 = 3600;

/// Convert clips into square video notes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Do not check the FFmpeg binary before converting
    #[arg(long, global = true)]
    skip_probe: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch one clip and turn it into a video note
    Convert {
        /// Direct http(s) URL, or a bot file id when --token is given
        #[arg(long)]
        source: String,
        /// Declared frame width in pixels
        #[arg(long)]
        width: u32,
        /// Declared frame height in pixels
        #[arg(long)]
        height: u32,
        /// Declared duration in seconds
        #[arg(long)]
        duration: u64,
        /// Declared file size in bytes
        #[arg(long)]
        size: u64,
        /// Where to write the finished note
        #[arg(short, long)]
        output: PathBuf,
        /// Bot token used to resolve file ids
        #[arg(long, env = "VNOTE_BOT_TOKEN", hide_env_values = true)]
        token: Option<String>,
        /// Language code for user-facing texts
        #[arg(long, default_value = "en")]
        lang: String,
    },
    /// Remove slot files left behind by crashed runs
    Sweep {
        #[arg(long, default_value_t = DEFAULT_SWEEP_AGE_SECS)]
        min_age_secs: u64,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[derive(Debug, Serialize)]
struct Summary {
    source: String,
    stage: String,
    succeeded: bool,
    output: Option<PathBuf>,
    output_bytes: Option<usize>,
    note_length: Option<u32>,
    finished_at: DateTime<Utc>,
}

/// Stands in for a chat: prints the texts a user would see and writes the
/// delivered note to disk.
struct ConsoleNotifier {
    output: PathBuf,
    delivered: Mutex<Option<(usize, u32)>>,
}

impl ConsoleNotifier {
    fn new(output: PathBuf) -> Self {
        Self {
            output,
            delivered: Mutex::new(None),
        }
    }

    fn delivered(&self) -> Option<(usize, u32)> {
        self.delivered.lock().ok().and_then(|d| *d)
    }

    fn say(&self, ctx: &RequestContext, key: MessageKey) {
        println!("[chat {}] {}", ctx.chat_id, messages::text(key, ctx.locale));
    }
}

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn notify_processing(&self, ctx: &RequestContext) -> Result<NoticeHandle> {
        self.say(ctx, MessageKey::Wait);
        Ok(NoticeHandle(format!("{}-wait", ctx.chat_id)))
    }

    async fn notify_too_large(&self, ctx: &RequestContext) -> Result<()> {
        self.say(ctx, MessageKey::TooLarge);
        Ok(())
    }

    async fn notify_error(&self, ctx: &RequestContext) -> Result<()> {
        self.say(ctx, MessageKey::Error);
        Ok(())
    }

    async fn deliver_artifact(&self, _ctx: &RequestContext, note: &VideoNote) -> Result<()> {
        if let Some(parent) = self.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
        }
        tokio::fs::write(&self.output, &note.bytes)
            .await
            .with_context(|| format!("Failed to write video note: {}", self.output.display()))?;
        if let Ok(mut delivered) = self.delivered.lock() {
            *delivered = Some((note.bytes.len(), note.length));
        }
        info!("📼 Video note written to {}", self.output.display());
        Ok(())
    }

    async fn retract_notice(&self, _ctx: &RequestContext, notice: NoticeHandle) -> Result<()> {
        info!("Processing notice {} retracted", notice.0);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let cfg = NoteConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command {
        Command::ShowConfig => {
            let rendered = toml::to_string_pretty(&cfg).context("Failed to render configuration")?;
            print!("{}", rendered);
            Ok(())
        }
        Command::Sweep { min_age_secs } => {
            let removed = sweep_orphans(&cfg.work_dir, Duration::from_secs(min_age_secs))
                .await
                .context("Failed to sweep work directory")?;
            info!("🧹 Removed {} orphaned slot file(s) from {}", removed, cfg.work_dir.display());
            Ok(())
        }
        Command::Convert {
            source,
            width,
            height,
            duration,
            size,
            output,
            token,
            lang,
        } => {
            let request = ConversionRequest {
                file_handle: source,
                width,
                height,
                duration_secs: duration,
                size_bytes: size,
            };
            convert(cfg, args.skip_probe, request, output, token, &lang).await
        }
    }
}

async fn convert(
    cfg: NoteConfig,
    skip_probe: bool,
    request: ConversionRequest,
    output: PathBuf,
    token: Option<String>,
    lang: &str,
) -> Result<()> {
    info!("Video note converter starting");
    info!("  Limits: {}", cfg.limits.describe());
    info!("  FFmpeg: {}", cfg.ffmpeg_bin.display());
    info!("  Work dir: {}", cfg.work_dir.display());

    let transcoder = FfmpegTranscoder::new(&cfg);
    if !skip_probe {
        transcoder
            .probe_engine()
            .await
            .context("FFmpeg is not usable for video notes")?;
    }

    match sweep_orphans(&cfg.work_dir, Duration::from_secs(DEFAULT_SWEEP_AGE_SECS)).await {
        Ok(0) => {}
        Ok(n) => info!("🧹 Cleaned {} orphaned slot file(s) on startup", n),
        Err(e) => warn!("Startup sweep failed: {:#}", e),
    }

    let client = Fetcher::build_client(&cfg)?;
    let resolver: Arc<dyn UrlResolver> = match token {
        Some(token) => Arc::new(BotApiResolver::new(client.clone(), cfg.bot_api_base.clone(), token)),
        None => Arc::new(DirectUrlResolver),
    };
    let fetcher = Fetcher::new(client, resolver);

    let notifier = Arc::new(ConsoleNotifier::new(output.clone()));
    let orchestrator = Orchestrator::new(
        Arc::new(cfg),
        fetcher,
        Arc::new(transcoder),
        notifier.clone(),
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling conversion");
                cancel.cancel();
            }
        }
    });

    let ctx = RequestContext::new(0, Locale::from_language_code(lang));
    let stage = orchestrator.handle(&ctx, &request, &cancel).await;

    let delivered = notifier.delivered();
    let summary = Summary {
        source: redact_token(&request.file_handle),
        stage: stage.to_string(),
        succeeded: stage == Stage::Succeeded,
        output: delivered.map(|_| output.clone()),
        output_bytes: delivered.map(|(len, _)| len),
        note_length: delivered.map(|(_, length)| length),
        finished_at: Utc::now(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    finish(stage, delivered.is_some(), &output)
}

fn finish(stage: Stage, delivered: bool, output: &Path) -> Result<()> {
    match stage {
        Stage::Succeeded if delivered => Ok(()),
        Stage::Succeeded => bail!("Conversion succeeded but {} could not be written", output.display()),
        other => bail!("Conversion {}", other),
    }
}
