//! fMP4 → MPEG-TS remux via an ffmpeg subprocess
//!
//! Stream-copies through a pipe pair with the bitstream filters MPEG-TS
//! requires. A non-zero exit with non-empty stdout is accepted: on some
//! platforms the pipe closes before the process status settles.

use std::process::Stdio;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Remux decrypted fMP4 bytes to MPEG-TS. Returns `None` when ffmpeg is
/// unavailable or produced no output; the caller serves the raw fMP4 then.
pub async fn remux_to_ts(input: Bytes) -> Option<Bytes> {
    let mut child = match Command::new("ffmpeg")
        .args([
            "-y",
            "-i",
            "pipe:0",
            "-c",
            "copy",
            "-copyts",
            "-bsf:v",
            "h264_mp4toannexb",
            "-bsf:a",
            "aac_adtstoasc",
            "-f",
            "mpegts",
            "pipe:1",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            tracing::error!("Failed to spawn ffmpeg: {err}");
            return None;
        }
    };

    let mut stdin = child.stdin.take()?;
    let writer = tokio::spawn(async move {
        let _ = stdin.write_all(&input).await;
        let _ = stdin.shutdown().await;
        // stdin drops here, closing the pipe so ffmpeg sees EOF.
    });

    let output = match child.wait_with_output().await {
        Ok(output) => output,
        Err(err) => {
            tracing::error!("ffmpeg wait failed: {err}");
            return None;
        }
    };
    let _ = writer.await;

    if !output.stdout.is_empty() {
        if !output.status.success() {
            tracing::debug!(
                "ffmpeg exited with {:?} but produced output (accepting): {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
                    .chars()
                    .take(200)
                    .collect::<String>()
            );
        }
        return Some(Bytes::from(output.stdout));
    }

    tracing::error!(
        "ffmpeg remux failed: {}",
        String::from_utf8_lossy(&output.stderr)
            .chars()
            .take(400)
            .collect::<String>()
    );
    None
}
