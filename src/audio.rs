use std::time::Duration;

/// Audio format constants for the device's G.711 µ-law stream.
///
/// The device produces and consumes single-channel 8-bit companded PCM at a
/// fixed 8 kHz rate, framed in 20 ms packets.

/// Samples (and bytes, at one byte per sample) per second.
pub const SAMPLE_RATE: u32 = 8000;

/// Duration of one audio frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Bytes in one audio frame: 8000 Hz * 0.020 s * 1 B/sample.
pub const FRAME_SIZE: usize = 160;

/// RTP mime type for G.711 µ-law.
pub const MIME_TYPE_PCMU: &str = "audio/PCMU";

/// Playback duration of `len` bytes of µ-law audio.
pub fn playback_duration(len: usize) -> Duration {
    Duration::from_secs_f64(len as f64 / SAMPLE_RATE as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_math_is_consistent() {
        let per_frame = playback_duration(FRAME_SIZE);
        assert_eq!(per_frame, FRAME_DURATION);
        assert_eq!(playback_duration(8000), Duration::from_secs(1));
    }
}
