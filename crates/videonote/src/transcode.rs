use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::NoteConfig;
use crate::error::TranscodeError;

/// Square region cut out of the source frame.
///
/// The side is the shorter frame dimension and the square is centred on the
/// longer one, so at most one of `x`/`y` is non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropGeometry {
    pub side: u32,
    pub x: u32,
    pub y: u32,
}

impl CropGeometry {
    pub fn for_frame(width: u32, height: u32) -> Self {
        let side = width.min(height);
        let (x, y) = if width > height {
            ((width - side) / 2, 0)
        } else if height > width {
            (0, (height - side) / 2)
        } else {
            (0, 0)
        };
        Self { side, x, y }
    }

    /// ffmpeg `crop=w:h:x:y` filter
    pub fn filter(&self) -> String {
        format!("crop={}:{}:{}:{}", self.side, self.side, self.x, self.y)
    }
}

/// The fixed output format of a video note. Only the crop depends on the
/// request; everything here is the same for every clip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeProfile {
    /// Output width and height in pixels
    pub side: u32,
    pub video_codec: String,
    pub video_profile: String,
    pub pixel_format: String,
    pub color_primaries: String,
    pub color_transfer: String,
    pub color_space: String,
    pub frame_rate: u32,
    pub video_bitrate: String,
    pub audio_codec: String,
    pub audio_channels: u32,
    pub sample_rate: u32,
    pub audio_bitrate: String,
}

impl Default for TranscodeProfile {
    fn default() -> Self {
        Self {
            side: 640,
            video_codec: "libx264".to_string(),
            video_profile: "main".to_string(),
            pixel_format: "yuv420p".to_string(),
            color_primaries: "bt709".to_string(),
            color_transfer: "bt709".to_string(),
            color_space: "bt709".to_string(),
            frame_rate: 30,
            video_bitrate: "1000k".to_string(),
            audio_codec: "aac".to_string(),
            audio_channels: 1,
            sample_rate: 44100,
            audio_bitrate: "64k".to_string(),
        }
    }
}

/// Runs the transcoding engine for one staged input.
///
/// Implementations read `input`, write the finished note to `output` and
/// must stop promptly once `cancel` fires.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        geometry: &CropGeometry,
        cancel: &CancellationToken,
    ) -> Result<(), TranscodeError>;
}

/// FFmpeg version information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl EngineVersion {
    /// Parse version from the first line of `ffmpeg -version`.
    /// Example: "ffmpeg version 6.1.1 Copyright ..." -> 6.1.1
    /// Distribution suffixes such as "4.4.2-0ubuntu0.22.04.1" are ignored.
    pub fn parse(version_str: &str) -> Result<Self> {
        let version_part = version_str
            .split_whitespace()
            .find(|s| s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))
            .ok_or_else(|| anyhow!("No version number found in: {}", version_str))?;

        let mut numbers = version_part
            .split(|c: char| c == '-' || c == '+')
            .next()
            .unwrap_or(version_part)
            .split('.')
            .map(leading_number);

        let major = numbers
            .next()
            .flatten()
            .ok_or_else(|| anyhow!("Invalid version format: {}", version_str))?;
        let minor = numbers.next().flatten().unwrap_or(0);
        let patch = numbers.next().flatten().unwrap_or(0);

        Ok(EngineVersion { major, minor, patch })
    }
}

fn leading_number(part: &str) -> Option<u32> {
    let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Result from a finished FFmpeg run
#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub exit_code: Option<i32>,
    pub stderr: String,
}

/// Last `lines` lines of engine diagnostics, for log messages
pub fn stderr_tail(stderr: &str, lines: usize) -> String {
    let all: Vec<&str> = stderr.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Command builder for generating FFmpeg command lines
pub struct CommandBuilder;

impl CommandBuilder {
    pub fn new() -> Self {
        CommandBuilder
    }

    /// Build the video note encode command:
    /// crop to the centred square, scale to the fixed side, then encode with
    /// the fixed video/audio profile into a faststart MP4.
    pub fn build_note_command(
        &self,
        input: &Path,
        output: &Path,
        geometry: &CropGeometry,
        profile: &TranscodeProfile,
    ) -> Vec<String> {
        let mut args = Vec::new();

        args.push("-hide_banner".to_string());
        args.push("-nostdin".to_string());
        args.push("-y".to_string());

        args.push("-i".to_string());
        args.push(input.to_string_lossy().to_string());

        // First video stream, audio if there is any
        args.push("-map".to_string());
        args.push("0:v:0".to_string());
        args.push("-map".to_string());
        args.push("0:a:0?".to_string());

        let filter_chain = [
            geometry.filter(),
            format!("scale={}:{}", profile.side, profile.side),
            "setsar=1".to_string(),
        ]
        .join(",");
        args.push("-vf".to_string());
        args.push(filter_chain);

        args.push("-c:v".to_string());
        args.push(profile.video_codec.clone());
        args.push("-profile:v".to_string());
        args.push(profile.video_profile.clone());
        args.push("-pix_fmt".to_string());
        args.push(profile.pixel_format.clone());
        args.push("-color_primaries".to_string());
        args.push(profile.color_primaries.clone());
        args.push("-color_trc".to_string());
        args.push(profile.color_transfer.clone());
        args.push("-colorspace".to_string());
        args.push(profile.color_space.clone());
        args.push("-r".to_string());
        args.push(profile.frame_rate.to_string());
        args.push("-b:v".to_string());
        args.push(profile.video_bitrate.clone());

        args.push("-c:a".to_string());
        args.push(profile.audio_codec.clone());
        args.push("-ac".to_string());
        args.push(profile.audio_channels.to_string());
        args.push("-ar".to_string());
        args.push(profile.sample_rate.to_string());
        args.push("-b:a".to_string());
        args.push(profile.audio_bitrate.clone());

        args.push("-movflags".to_string());
        args.push("+faststart".to_string());
        args.push("-f".to_string());
        args.push("mp4".to_string());

        args.push(output.to_string_lossy().to_string());

        args
    }
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self::new()
    }
}

enum WaitOutcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Transcoder backed by a local ffmpeg binary
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    pub ffmpeg_bin: PathBuf,
    pub profile: TranscodeProfile,
    pub timeout: Option<Duration>,
}

impl FfmpegTranscoder {
    pub fn new(config: &NoteConfig) -> Self {
        Self {
            ffmpeg_bin: config.ffmpeg_bin.clone(),
            profile: config.profile.clone(),
            timeout: config.transcode_timeout(),
        }
    }

    /// Check that the binary runs and offers the encoders the profile needs.
    /// An unparseable version string is only a warning.
    pub async fn probe_engine(&self) -> Result<Option<EngineVersion>> {
        let output = Command::new(&self.ffmpeg_bin)
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to execute FFmpeg at: {}", self.ffmpeg_bin.display()))?;

        if !output.status.success() {
            return Err(anyhow!("FFmpeg version check failed"));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout
            .lines()
            .next()
            .ok_or_else(|| anyhow!("Empty output from FFmpeg -version"))?;
        let version = match EngineVersion::parse(first_line) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Could not parse FFmpeg version ({}), continuing", e);
                None
            }
        };

        let output = Command::new(&self.ffmpeg_bin)
            .arg("-hide_banner")
            .arg("-encoders")
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to query FFmpeg encoders at: {}", self.ffmpeg_bin.display()))?;

        if !output.status.success() {
            return Err(anyhow!("FFmpeg encoder query failed"));
        }

        let encoders = String::from_utf8_lossy(&output.stdout);
        let missing: Vec<&str> = [self.profile.video_codec.as_str(), self.profile.audio_codec.as_str()]
            .into_iter()
            .filter(|name| !encoder_listed(&encoders, name))
            .collect();
        if !missing.is_empty() {
            return Err(anyhow!(
                "FFmpeg at {} lacks required encoder(s): {}",
                self.ffmpeg_bin.display(),
                missing.join(", ")
            ));
        }

        match &version {
            Some(v) => info!("🎬 Using FFmpeg {}.{}.{} at {}", v.major, v.minor, v.patch, self.ffmpeg_bin.display()),
            None => info!("🎬 Using FFmpeg at {}", self.ffmpeg_bin.display()),
        }
        Ok(version)
    }

    /// Run ffmpeg with `args`, capturing stderr.
    ///
    /// The process is killed when the watchdog expires or `cancel` fires.
    /// A non-zero exit becomes `EngineFailed` carrying the captured stderr.
    pub async fn execute_ffmpeg(
        &self,
        args: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<EngineOutput, TranscodeError> {
        debug!("Executing FFmpeg: {} {}", self.ffmpeg_bin.display(), args.join(" "));

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| TranscodeError::Spawn {
            bin: self.ffmpeg_bin.clone(),
            source,
        })?;

        let stderr_handle = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                // Not always UTF-8; must drain to EOF regardless
                let mut raw = Vec::new();
                if let Err(e) = BufReader::new(stderr).read_to_end(&mut raw).await {
                    warn!("Failed to read FFmpeg stderr: {}", e);
                }
                String::from_utf8_lossy(&raw).trim_end().to_string()
            })
        });

        let watchdog = async {
            match self.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            status = child.wait() => WaitOutcome::Exited(status),
            _ = watchdog => WaitOutcome::TimedOut,
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
        };

        let status = match outcome {
            WaitOutcome::Exited(status) => status.map_err(TranscodeError::Wait)?,
            WaitOutcome::TimedOut => {
                self.kill(&mut child).await;
                let secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
                return Err(TranscodeError::TimedOut { secs });
            }
            WaitOutcome::Cancelled => {
                self.kill(&mut child).await;
                return Err(TranscodeError::Cancelled);
            }
        };

        let stderr = match stderr_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(TranscodeError::EngineFailed {
                code: status.code(),
                stderr,
            });
        }

        debug!("FFmpeg finished:\n{}", stderr_tail(&stderr, 10));
        Ok(EngineOutput {
            exit_code: status.code(),
            stderr,
        })
    }

    async fn kill(&self, child: &mut tokio::process::Child) {
        if let Err(e) = child.kill().await {
            warn!("Failed to kill FFmpeg process: {}", e);
        }
    }
}

fn encoder_listed(encoders: &str, name: &str) -> bool {
    encoders
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(name))
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        geometry: &CropGeometry,
        cancel: &CancellationToken,
    ) -> Result<(), TranscodeError> {
        let args = CommandBuilder::new().build_note_command(input, output, geometry, &self.profile);
        self.execute_ffmpeg(args, cancel).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_crop_landscape() {
        let g = CropGeometry::for_frame(1920, 1080);
        assert_eq!(g, CropGeometry { side: 1080, x: 420, y: 0 });
        assert_eq!(g.filter(), "crop=1080:1080:420:0");
    }

    #[test]
    fn test_crop_portrait_and_square() {
        assert_eq!(CropGeometry::for_frame(720, 1280), CropGeometry { side: 720, x: 0, y: 280 });
        assert_eq!(CropGeometry::for_frame(500, 500), CropGeometry { side: 500, x: 0, y: 0 });
        // Odd leftovers round down
        assert_eq!(CropGeometry::for_frame(641, 640), CropGeometry { side: 640, x: 0, y: 0 });
        assert_eq!(CropGeometry::for_frame(643, 640), CropGeometry { side: 640, x: 1, y: 0 });
    }

    proptest! {
        #[test]
        fn test_crop_stays_inside_the_frame(width in 1u32..10_000, height in 1u32..10_000) {
            let g = CropGeometry::for_frame(width, height);
            prop_assert_eq!(g.side, width.min(height));
            prop_assert!(g.x + g.side <= width);
            prop_assert!(g.y + g.side <= height);
            prop_assert!(g.x == 0 || g.y == 0);
            if width <= height {
                prop_assert_eq!(g.x, 0);
            }
            if height <= width {
                prop_assert_eq!(g.y, 0);
            }
        }
    }

    #[test]
    fn test_version_parsing() {
        let v = EngineVersion::parse("ffmpeg version 6.1.1 Copyright (c) 2000-2023").unwrap();
        assert_eq!(v, EngineVersion { major: 6, minor: 1, patch: 1 });

        let v = EngineVersion::parse("ffmpeg version 4.4.2-0ubuntu0.22.04.1 Copyright").unwrap();
        assert_eq!(v, EngineVersion { major: 4, minor: 4, patch: 2 });

        let v = EngineVersion::parse("ffmpeg version 7.0").unwrap();
        assert_eq!(v, EngineVersion { major: 7, minor: 0, patch: 0 });

        assert!(EngineVersion::parse("ffmpeg version N-112345-gdeadbeef").is_err());
    }

    #[test]
    fn test_note_command_layout() {
        let args = CommandBuilder::new().build_note_command(
            Path::new("/work/vnote-a-in.mp4"),
            Path::new("/work/vnote-a-out.mp4"),
            &CropGeometry::for_frame(1920, 1080),
            &TranscodeProfile::default(),
        );
        let cmd = args.join(" ");

        assert!(cmd.contains("-i /work/vnote-a-in.mp4"));
        assert!(cmd.contains("-vf crop=1080:1080:420:0,scale=640:640,setsar=1"), "got: {cmd}");
        assert!(cmd.contains("-c:v libx264 -profile:v main -pix_fmt yuv420p"));
        assert!(cmd.contains("-color_primaries bt709 -color_trc bt709 -colorspace bt709"));
        assert!(cmd.contains("-r 30 -b:v 1000k"));
        assert!(cmd.contains("-c:a aac -ac 1 -ar 44100 -b:a 64k"));
        assert!(cmd.contains("-movflags +faststart"));
        assert_eq!(args.last().map(String::as_str), Some("/work/vnote-a-out.mp4"));
        // Input comes before any output option
        let input_pos = args.iter().position(|a| a == "-i").unwrap();
        let vf_pos = args.iter().position(|a| a == "-vf").unwrap();
        assert!(input_pos < vf_pos);
    }

    #[test]
    fn test_hostile_paths_stay_single_arguments() {
        let input = Path::new("/work/clip; rm -rf ~.mp4");
        let args = CommandBuilder::new().build_note_command(
            input,
            Path::new("/work/out.mp4"),
            &CropGeometry::for_frame(10, 10),
            &TranscodeProfile::default(),
        );
        assert!(args.iter().any(|a| a == "/work/clip; rm -rf ~.mp4"));
    }

    #[test]
    fn test_encoder_listing() {
        let listing = " V....D libx264              libx264 H.264 / AVC\n A....D aac                  AAC (Advanced Audio Coding)\n";
        assert!(encoder_listed(listing, "libx264"));
        assert!(encoder_listed(listing, "aac"));
        assert!(!encoder_listed(listing, "libx265"));
        assert!(!encoder_listed(listing, "H.264"));
    }

    #[test]
    fn test_stderr_tail() {
        assert_eq!(stderr_tail("a\nb\nc\nd", 2), "c\nd");
        assert_eq!(stderr_tail("a", 5), "a");
        assert_eq!(stderr_tail("", 5), "");
    }

    #[cfg(unix)]
    mod engine {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::time::Instant;
        use tempfile::TempDir;

        fn fake_ffmpeg(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-ffmpeg");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn transcoder(bin: PathBuf, timeout: Option<Duration>) -> FfmpegTranscoder {
            FfmpegTranscoder {
                ffmpeg_bin: bin,
                profile: TranscodeProfile::default(),
                timeout,
            }
        }

        #[tokio::test]
        async fn test_successful_run_writes_output() {
            let dir = TempDir::new().unwrap();
            let bin = fake_ffmpeg(
                dir.path(),
                "for arg in \"$@\"; do last=\"$arg\"; done\nprintf 'note' > \"$last\"\necho 'frame=30' >&2",
            );
            let input = dir.path().join("in.mp4");
            let output = dir.path().join("out.mp4");
            std::fs::write(&input, b"source").unwrap();

            transcoder(bin, None)
                .transcode(&input, &output, &CropGeometry::for_frame(1920, 1080), &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(std::fs::read(&output).unwrap(), b"note");
        }

        #[tokio::test]
        async fn test_non_zero_exit_keeps_stderr() {
            let dir = TempDir::new().unwrap();
            let bin = fake_ffmpeg(dir.path(), "echo 'Invalid data found when processing input' >&2\nexit 1");

            let err = transcoder(bin, None)
                .execute_ffmpeg(vec!["-i".into(), "x".into()], &CancellationToken::new())
                .await
                .unwrap_err();
            match err {
                TranscodeError::EngineFailed { code, stderr } => {
                    assert_eq!(code, Some(1));
                    assert!(stderr.contains("Invalid data"));
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_non_utf8_stderr_is_drained() {
            let dir = TempDir::new().unwrap();
            let bin = fake_ffmpeg(
                dir.path(),
                "printf 'title: caf\\351\\n' >&2\ni=0\nwhile [ $i -lt 5000 ]; do echo \"frame=$i\" >&2; i=$((i+1)); done\nexit 0",
            );

            let output = transcoder(bin, Some(Duration::from_secs(30)))
                .execute_ffmpeg(vec![], &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(output.exit_code, Some(0));
            assert!(output.stderr.starts_with("title: caf\u{FFFD}"));
            assert!(output.stderr.ends_with("frame=4999"));
        }

        #[tokio::test]
        async fn test_missing_binary() {
            let dir = TempDir::new().unwrap();
            let err = transcoder(dir.path().join("no-such-ffmpeg"), None)
                .execute_ffmpeg(vec![], &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, TranscodeError::Spawn { .. }));
        }

        #[tokio::test]
        async fn test_watchdog_kills_hung_engine() {
            let dir = TempDir::new().unwrap();
            let bin = fake_ffmpeg(dir.path(), "exec sleep 30");

            let started = Instant::now();
            let err = transcoder(bin, Some(Duration::from_millis(200)))
                .execute_ffmpeg(vec![], &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, TranscodeError::TimedOut { .. }));
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[tokio::test]
        async fn test_cancellation_kills_engine() {
            let dir = TempDir::new().unwrap();
            let bin = fake_ffmpeg(dir.path(), "exec sleep 30");
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                trigger.cancel();
            });

            let started = Instant::now();
            let err = transcoder(bin, None).execute_ffmpeg(vec![], &cancel).await.unwrap_err();
            assert!(matches!(err, TranscodeError::Cancelled));
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[tokio::test]
        async fn test_probe_engine() {
            let dir = TempDir::new().unwrap();
            let bin = fake_ffmpeg(
                dir.path(),
                "case \"$*\" in\n  *-encoders*) printf ' V....D libx264  H.264\\n A....D aac  AAC\\n' ;;\n  *) echo 'ffmpeg version 6.1.1 Copyright (c) 2000-2023' ;;\nesac",
            );
            let version = transcoder(bin, None).probe_engine().await.unwrap();
            assert_eq!(version, Some(EngineVersion { major: 6, minor: 1, patch: 1 }));
        }

        #[tokio::test]
        async fn test_probe_engine_reports_missing_encoder() {
            let dir = TempDir::new().unwrap();
            let bin = fake_ffmpeg(
                dir.path(),
                "case \"$*\" in\n  *-encoders*) printf ' A....D aac  AAC\\n' ;;\n  *) echo 'ffmpeg version 6.1.1' ;;\nesac",
            );
            let err = transcoder(bin, None).probe_engine().await.unwrap_err();
            assert!(err.to_string().contains("libx264"), "got: {err}");
        }
    }
}
