//! FFmpeg command line and stderr parsing.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::LazyLock;

use mediopt_core::VideoProfile;
use regex::Regex;

static REGEX_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid duration regex")
});
static REGEX_VIDEO_SIZE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Stream #\d+:\d+.*Video:.*?\b(\d{2,5})x(\d{2,5})\b").expect("valid stream regex")
});
static REGEX_OUT_TIME_US: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^out_time_us=(\d+)$").expect("valid progress regex"));
static REGEX_PROGRESS_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_]+=\S*$").expect("valid key regex"));

/// Stderr lines kept for error reports.
const TAIL_LINES: usize = 20;

/// Where the encoder reads its input from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FfmpegInput {
    /// Standard input, written as chunks arrive.
    Pipe,
    /// A fully written scratch file.
    File(PathBuf),
}

/// Arguments for a streaming H.264 encode written to stdout as fragmented MP4.
pub fn build_ffmpeg_args(profile: &VideoProfile, input: &FfmpegInput) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "info", "-nostats", "-progress", "pipe:2"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    match input {
        FfmpegInput::Pipe => args.extend(["-i".to_string(), "pipe:0".to_string()]),
        FfmpegInput::File(path) => args.extend([
            "-nostdin".to_string(),
            "-i".to_string(),
            path.to_string_lossy().to_string(),
        ]),
    }

    // libx264 needs even dimensions.
    let scale = format!("scale='trunc(min({},iw)/2)*2':-2", profile.max_width);

    args.extend([
        "-map".to_string(),
        "0:v:0".to_string(),
        "-map".to_string(),
        "0:a?".to_string(),
        "-c:v".to_string(),
        profile.codec.clone(),
        "-preset".to_string(),
        profile.preset.clone(),
        "-crf".to_string(),
        profile.crf.to_string(),
        "-vf".to_string(),
        scale,
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "128k".to_string(),
        "-movflags".to_string(),
        "frag_keyframe+empty_moov+default_base_moof".to_string(),
        "-f".to_string(),
        profile.container.clone(),
        "pipe:1".to_string(),
    ]);
    args
}

/// Accumulates what the encoder reports on stderr.
#[derive(Debug, Default)]
pub struct FfmpegDiagnostics {
    input_duration: Option<f64>,
    output_size: Option<(u32, u32)>,
    encoded_us: Option<u64>,
    finished: bool,
    in_output_section: bool,
    last_percent: Option<u8>,
    tail: VecDeque<String>,
}

impl FfmpegDiagnostics {
    /// Feed one stderr line. Returns a progress percentage when it changed.
    pub fn observe(&mut self, line: &str) -> Option<u8> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if REGEX_PROGRESS_KEY.is_match(line) {
            if let Some(caps) = REGEX_OUT_TIME_US.captures(line) {
                if let Ok(us) = caps[1].parse::<u64>() {
                    self.encoded_us = Some(us);
                }
            } else if line == "progress=end" {
                self.finished = true;
            }
            return self.percent_changed();
        }

        if line.starts_with("Output #") {
            self.in_output_section = true;
        } else if line.starts_with("Input #") {
            self.in_output_section = false;
        }

        if self.input_duration.is_none() && !self.in_output_section {
            if let Some(caps) = REGEX_DURATION.captures(line) {
                self.input_duration = parse_timestamp(&caps[1], &caps[2], &caps[3]);
            }
        }
        if self.in_output_section {
            if let Some(caps) = REGEX_VIDEO_SIZE.captures(line) {
                if let (Ok(w), Ok(h)) = (caps[1].parse(), caps[2].parse()) {
                    self.output_size = Some((w, h));
                }
            }
        }

        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());
        None
    }

    fn percent_changed(&mut self) -> Option<u8> {
        let percent = if self.finished {
            100
        } else {
            let total = self.input_duration?;
            let encoded = self.encoded_us? as f64 / 1_000_000.0;
            if total <= 0.0 {
                return None;
            }
            ((encoded / total) * 100.0).clamp(0.0, 99.0) as u8
        };
        if self.last_percent == Some(percent) {
            return None;
        }
        self.last_percent = Some(percent);
        Some(percent)
    }

    /// Seconds of media: the input duration when known, otherwise what was encoded.
    pub fn duration(&self) -> Option<f64> {
        self.input_duration
            .or_else(|| self.encoded_us.map(|us| us as f64 / 1_000_000.0))
    }

    pub fn output_size(&self) -> Option<(u32, u32)> {
        self.output_size
    }

    /// Last stderr lines, newest last.
    pub fn tail(&self) -> String {
        self.tail.iter().cloned().collect::<Vec<_>>().join("; ")
    }
}

fn parse_timestamp(hours: &str, minutes: &str, seconds: &str) -> Option<f64> {
    let h: f64 = hours.parse().ok()?;
    let m: f64 = minutes.parse().ok()?;
    let s: f64 = seconds.parse().ok()?;
    Some(h * 3600.0 + m * 60.0 + s)
}
