//! Encoder command-line construction
//!
//! The argument set is fixed by the configured profile. The only input-dependent piece is
//! the declared input size and the scale filter inserted when it differs from the target.

use crate::config::EncoderConfig;
use crate::types::SessionId;

/// Build the low-latency HLS argument list for raw frames of `width`x`height` on stdin
///
/// Output lands in the session's own directory under `output_dir`.
pub fn hls_args(config: &EncoderConfig, session: SessionId, width: u32, height: u32) -> Vec<String> {
    let segments = config.segment_path(session).to_string_lossy().into_owned();
    let playlist = config.playlist_path(session).to_string_lossy().into_owned();

    let mut args: Vec<String> = Vec::with_capacity(72);
    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

    // Raw input on stdin, no audio
    push(&["-f", "rawvideo", "-pix_fmt", &config.input_pixel_format]);
    push(&["-s", &format!("{width}x{height}")]);
    push(&["-r", &config.frame_rate.to_string()]);
    push(&["-i", "pipe:0", "-an"]);

    if width != config.width || height != config.height {
        push(&["-vf", &format!("scale={}:{}", config.width, config.height)]);
    }

    push(&["-c:v", "libx264", "-preset", &config.preset, "-tune", &config.tune]);
    push(&["-crf", &config.crf.to_string()]);
    push(&["-g", &config.gop_size.to_string()]);
    push(&["-keyint_min", &config.keyint_min.to_string()]);
    push(&["-sc_threshold", "0"]);
    push(&["-maxrate", &config.max_bitrate, "-bufsize", &config.bufsize]);
    push(&["-threads", &config.threads.to_string()]);

    push(&["-fflags", "nobuffer", "-flags", "low_delay", "-strict", "experimental"]);
    push(&["-avioflags", "direct"]);
    push(&["-profile:v", &config.profile, "-level", &config.level]);
    push(&["-x264opts", &x264_opts(config)]);

    push(&["-f", "hls"]);
    push(&["-hls_time", &config.segment_duration.to_string()]);
    push(&["-hls_list_size", &config.playlist_size.to_string()]);
    push(&["-hls_flags", "delete_segments+independent_segments+append_list"]);
    push(&["-hls_segment_filename", &segments]);
    push(&[&playlist]);

    args
}

fn x264_opts(config: &EncoderConfig) -> String {
    format!(
        "no-scenecut:vbv-maxrate={}:vbv-bufsize={}:no-mbtree:sliced-threads:sync-lookahead=0",
        kbits(&config.max_bitrate),
        kbits(&config.bufsize)
    )
}

/// `"1500k"` → `"1500"`; values without a `k` suffix pass through
fn kbits(rate: &str) -> &str {
    rate.strip_suffix(['k', 'K']).unwrap_or(rate)
}
