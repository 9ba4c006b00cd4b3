use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use mediopt_core::{TransformProfile, VideoProfile};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::ffmpeg::{build_ffmpeg_args, FfmpegDiagnostics, FfmpegInput};
use crate::error::TransformError;
use crate::pipeline::{ChunkSink, Feed, MediaTransform, TransformIo, TransformMonitor, TransformSummary};

const READ_CHUNK: usize = 64 * 1024;
/// How long to wait for stderr to drain once the encoder is gone.
const DIAGNOSTICS_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedEnd {
    Complete,
    /// The encoder stopped reading before end of input.
    Rejected,
}

#[derive(Debug, Clone)]
enum Encoder {
    Ffmpeg,
    /// Any stdin-to-stdout filter.
    Custom(Vec<String>),
}

/// Streams input through an encoder subprocess and forwards its stdout.
///
/// The subprocess is spawned with `kill_on_drop`, and every exit path kills
/// and reaps it before returning.
#[derive(Debug, Clone)]
pub struct VideoTransform {
    profile: TransformProfile,
    video: VideoProfile,
    program: String,
    encoder: Encoder,
    spool_input: bool,
}

impl VideoTransform {
    /// FFmpeg encoder. With `spool_input` the whole input is written to the
    /// scratch directory first, for containers that cannot be read from a pipe.
    pub fn new(
        video: VideoProfile,
        ffmpeg_path: impl Into<String>,
        spool_input: bool,
    ) -> Result<Self, TransformError> {
        let ffmpeg_path = ffmpeg_path.into();
        if ffmpeg_path.trim().is_empty() {
            return Err(TransformError::Config("ffmpeg_path is empty".to_string()));
        }
        let dangerous_chars = [';', '|', '&', '$', '`', '(', ')', '<', '>', '\n', '\r'];
        if ffmpeg_path.chars().any(|c| dangerous_chars.contains(&c)) {
            return Err(TransformError::Config(
                "Invalid ffmpeg_path: contains dangerous characters".to_string(),
            ));
        }

        Ok(Self {
            profile: TransformProfile::Video(video.clone()),
            video,
            program: ffmpeg_path,
            encoder: Encoder::Ffmpeg,
            spool_input,
        })
    }

    /// Run an arbitrary stdin-to-stdout program instead of FFmpeg.
    pub fn from_command(video: VideoProfile, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            profile: TransformProfile::Video(video.clone()),
            video,
            program: program.into(),
            encoder: Encoder::Custom(args),
            spool_input: false,
        }
    }

    fn command(&self, input: &FfmpegInput) -> Command {
        let args = match &self.encoder {
            Encoder::Ffmpeg => build_ffmpeg_args(&self.video, input),
            Encoder::Custom(args) => args.clone(),
        };
        let stdin = match input {
            FfmpegInput::Pipe => Stdio::piped(),
            FfmpegInput::File(_) => Stdio::null(),
        };

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl MediaTransform for VideoTransform {
    fn profile(&self) -> &TransformProfile {
        &self.profile
    }

    fn needs_scratch(&self) -> bool {
        self.spool_input
    }

    #[tracing::instrument(skip(self, io), fields(program = %self.program))]
    async fn run(&self, mut io: TransformIo) -> Result<TransformSummary, TransformError> {
        let input = if self.spool_input {
            let dir = io.scratch_dir.clone().ok_or_else(|| {
                TransformError::Config("spooled input requires a scratch directory".to_string())
            })?;
            FfmpegInput::File(spool_input(&mut io, &dir).await?)
        } else {
            FfmpegInput::Pipe
        };

        let mut child = self
            .command(&input)
            .spawn()
            .map_err(|e| TransformError::Spawn(format!("{}: {}", self.program, e)))?;
        if let Some(pid) = child.id() {
            tracing::debug!(pid, "Encoder started");
            io.monitor.subprocess_spawned(pid);
        }

        let (stdin, stdout, stderr) = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let diagnostics = stderr.map(|stderr| tokio::spawn(read_diagnostics(stderr, io.monitor.clone())));

        let TransformIo {
            input: mut feed,
            mut output,
            cancel,
            monitor,
            ..
        } = io;

        let result = match stdout {
            Some(stdout) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(TransformError::Canceled),
                    result = stream_through(&mut feed, stdin, stdout, &mut output) => result,
                }
            }
            None => Err(TransformError::Spawn("encoder stdout was not captured".to_string())),
        };

        let feed_end = match result {
            Ok(feed_end) => feed_end,
            Err(e) => {
                stop_child(&mut child).await;
                collect_diagnostics(diagnostics).await;
                return Err(e);
            }
        };

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                stop_child(&mut child).await;
                collect_diagnostics(diagnostics).await;
                return Err(TransformError::Canceled);
            }
            status = child.wait() => status?,
        };
        let diagnostics = collect_diagnostics(diagnostics).await;

        if !status.success() {
            return Err(TransformError::Exited {
                status,
                detail: diagnostics.tail(),
            });
        }
        if feed_end == FeedEnd::Rejected {
            return Err(TransformError::InputRejected);
        }

        monitor.progress(100);
        let (width, height) = match diagnostics.output_size() {
            Some((w, h)) => (Some(w), Some(h)),
            None => (None, None),
        };
        tracing::debug!(
            bytes = output.bytes_sent(),
            duration = ?diagnostics.duration(),
            "Encoder finished"
        );

        Ok(TransformSummary {
            format: self.profile.output_format().to_string(),
            width,
            height,
            duration: diagnostics.duration(),
        })
    }
}

/// Write all input to `dir/input` and return its path.
async fn spool_input(io: &mut TransformIo, dir: &Path) -> Result<PathBuf, TransformError> {
    let path = dir.join("input");
    let mut file = tokio::fs::File::create(&path).await?;
    let mut written = 0u64;
    while let Some(chunk) = io.next_input().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    tracing::debug!(path = %path.display(), bytes = written, "Input spooled");
    Ok(path)
}

/// Feed stdin and drain stdout concurrently until the encoder closes stdout.
async fn stream_through(
    feed: &mut mpsc::Receiver<Feed>,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    output: &mut ChunkSink,
) -> Result<FeedEnd, TransformError> {
    let feeding = async {
        match stdin {
            Some(stdin) => feed_stdin(feed, stdin).await,
            None => Ok(FeedEnd::Complete),
        }
    };
    tokio::pin!(feeding);
    let pumping = pump_stdout(stdout, output);
    tokio::pin!(pumping);

    let mut feed_end = None;
    loop {
        tokio::select! {
            biased;
            end = &mut feeding, if feed_end.is_none() => feed_end = Some(end?),
            pumped = &mut pumping => {
                pumped?;
                // Stdout closed while input was still flowing.
                return Ok(feed_end.unwrap_or(FeedEnd::Rejected));
            }
        }
    }
}

async fn feed_stdin(
    feed: &mut mpsc::Receiver<Feed>,
    mut stdin: ChildStdin,
) -> Result<FeedEnd, TransformError> {
    loop {
        match feed.recv().await {
            Some(Feed::Data(chunk)) => {
                if let Err(e) = stdin.write_all(&chunk).await {
                    if e.kind() == std::io::ErrorKind::BrokenPipe {
                        tracing::debug!("Encoder closed its input early");
                        return Ok(FeedEnd::Rejected);
                    }
                    return Err(e.into());
                }
            }
            Some(Feed::End) => {
                if let Err(e) = stdin.shutdown().await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        return Err(e.into());
                    }
                }
                return Ok(FeedEnd::Complete);
            }
            None => return Err(TransformError::InputAborted),
        }
    }
}

async fn pump_stdout(mut stdout: ChildStdout, output: &mut ChunkSink) -> Result<(), TransformError> {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.reserve(READ_CHUNK);
        if stdout.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
        output.send(buf.split().freeze()).await?;
    }
}

async fn read_diagnostics(stderr: ChildStderr, monitor: TransformMonitor) -> FfmpegDiagnostics {
    let mut reader = BufReader::new(stderr);
    let mut diagnostics = FfmpegDiagnostics::default();
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if let Some(percent) = diagnostics.observe(&String::from_utf8_lossy(&line)) {
                    monitor.progress(percent);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Stopped reading encoder stderr");
                break;
            }
        }
    }
    diagnostics
}

async fn collect_diagnostics(task: Option<JoinHandle<FfmpegDiagnostics>>) -> FfmpegDiagnostics {
    let Some(mut task) = task else {
        return FfmpegDiagnostics::default();
    };
    match tokio::time::timeout(DIAGNOSTICS_GRACE, &mut task).await {
        Ok(Ok(diagnostics)) => diagnostics,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Encoder stderr reader failed");
            FfmpegDiagnostics::default()
        }
        Err(_) => {
            task.abort();
            FfmpegDiagnostics::default()
        }
    }
}

async fn stop_child(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "Encoder already exited");
    }
    match child.wait().await {
        Ok(status) => tracing::debug!(status = %status, "Encoder stopped"),
        Err(e) => tracing::warn!(error = %e, "Failed to reap encoder"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Encoded;
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    fn io_pair(
        capacity: usize,
        scratch_dir: Option<PathBuf>,
    ) -> (TransformIo, mpsc::Sender<Feed>, mpsc::Receiver<Encoded>, CancellationToken) {
        let (feed_tx, feed_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let io = TransformIo {
            input: feed_rx,
            output: ChunkSink::new(out_tx),
            cancel: cancel.clone(),
            monitor: TransformMonitor::detached(),
            scratch_dir,
        };
        (io, feed_tx, out_rx, cancel)
    }

    async fn collect(mut rx: mpsc::Receiver<Encoded>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(Encoded::Data(chunk)) = rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[test]
    fn test_rejects_dangerous_ffmpeg_path() {
        for path in ["ffmpeg; rm -rf /", "ffmpeg | cat", "$(ffmpeg)", ""] {
            assert!(matches!(
                VideoTransform::new(VideoProfile::default(), path, false),
                Err(TransformError::Config(_))
            ));
        }
        assert!(VideoTransform::new(VideoProfile::default(), "/usr/bin/ffmpeg", false).is_ok());
    }

    #[test]
    fn test_spooling_requires_scratch() {
        let transform = VideoTransform::new(VideoProfile::default(), "ffmpeg", true).unwrap();
        assert!(transform.needs_scratch());
        assert!(!VideoTransform::from_command(VideoProfile::default(), "cat", vec![]).needs_scratch());
    }

    #[tokio::test]
    async fn test_streams_through_subprocess() {
        let (io, feed_tx, out_rx, _cancel) = io_pair(4, None);
        let transform = VideoTransform::from_command(VideoProfile::default(), "cat", vec![]);
        let run = tokio::spawn(async move { transform.run(io).await });
        let reader = tokio::spawn(collect(out_rx));

        for part in [b"frame-1 ".as_slice(), b"frame-2 ".as_slice(), b"frame-3".as_slice()] {
            feed_tx.send(Feed::Data(Bytes::copy_from_slice(part))).await.unwrap();
        }
        feed_tx.send(Feed::End).await.unwrap();

        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.format, "mp4");
        assert_eq!(reader.await.unwrap(), b"frame-1 frame-2 frame-3");
    }

    #[tokio::test]
    async fn test_spooled_input_is_read_from_file() {
        let scratch = tempfile::tempdir().unwrap();
        let (io, feed_tx, out_rx, _cancel) = io_pair(4, Some(scratch.path().to_path_buf()));
        let transform = VideoTransform {
            spool_input: true,
            ..VideoTransform::from_command(
                VideoProfile::default(),
                "cat",
                vec![scratch.path().join("input").to_string_lossy().to_string()],
            )
        };
        let reader = tokio::spawn(collect(out_rx));

        feed_tx.send(Feed::Data(Bytes::from_static(b"spooled"))).await.unwrap();
        feed_tx.send(Feed::End).await.unwrap();

        transform.run(io).await.unwrap();
        assert_eq!(reader.await.unwrap(), b"spooled");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_an_error() {
        let (io, feed_tx, _out_rx, _cancel) = io_pair(4, None);
        let transform = VideoTransform::from_command(
            VideoProfile::default(),
            "sh",
            vec!["-c".to_string(), "cat >/dev/null; echo 'Invalid data found' >&2; exit 1".to_string()],
        );
        feed_tx.send(Feed::Data(Bytes::from_static(b"junk"))).await.unwrap();
        feed_tx.send(Feed::End).await.unwrap();

        match transform.run(io).await {
            Err(TransformError::Exited { detail, .. }) => assert!(detail.contains("Invalid data found")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_encoder_that_stops_reading_is_rejected() {
        let (io, feed_tx, _out_rx, _cancel) = io_pair(4, None);
        let transform = VideoTransform::from_command(VideoProfile::default(), "true", vec![]);
        let run = tokio::spawn(async move { transform.run(io).await });

        // Keep input open; the encoder exits without reading it.
        feed_tx.send(Feed::Data(Bytes::from_static(b"ignored"))).await.unwrap();

        assert!(matches!(run.await.unwrap(), Err(TransformError::InputRejected)));
        drop(feed_tx);
    }

    #[tokio::test]
    async fn test_cancel_kills_subprocess() {
        let (io, feed_tx, _out_rx, cancel) = io_pair(4, None);
        let transform = VideoTransform::from_command(VideoProfile::default(), "cat", vec![]);
        feed_tx.send(Feed::Data(Bytes::from_static(b"partial"))).await.unwrap();

        let run = tokio::spawn(async move { transform.run(io).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        assert!(matches!(run.await.unwrap(), Err(TransformError::Canceled)));
        drop(feed_tx);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let (io, _feed_tx, _out_rx, _cancel) = io_pair(4, None);
        let transform =
            VideoTransform::from_command(VideoProfile::default(), "/nonexistent/encoder", vec![]);
        assert!(matches!(transform.run(io).await, Err(TransformError::Spawn(_))));
    }
}
