//! # Frame Chunking and Combination
//!
//! Shapes PCM into the units the two sides of the pipeline expect:
//! - **chunk**: arbitrary 48 kHz audio → fixed 480-sample transport frames
//! - **combine**: many small captured frames → one aggregation batch
//!
//! Also holds the little-endian byte conversions shared by every adapter.
//! An odd trailing byte is always dropped, never interpreted.

use byteorder::{ByteOrder, LittleEndian};

/// Samples in one transport frame (10 ms at 48 kHz)
pub const FRAME_SAMPLES: usize = 480;

/// Duration of one transport frame in milliseconds
pub const FRAME_DURATION_MS: u32 = 10;

/// One 10 ms frame of 48 kHz mono PCM.
///
/// A fixed-size array, so a frame handed to the transport can never be short
/// or long.
pub type TransportFrame = [i16; FRAME_SAMPLES];

/// Decode little-endian 16-bit PCM. An odd trailing byte is ignored.
pub fn samples_from_le_bytes(data: &[u8]) -> Vec<i16> {
    let even_len = data.len() & !1;
    let mut samples = vec![0i16; even_len / 2];
    LittleEndian::read_i16_into(&data[..even_len], &mut samples);
    samples
}

/// Encode samples as little-endian 16-bit PCM.
pub fn samples_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut bytes);
    bytes
}

/// Split 48 kHz PCM into transport frames.
///
/// ## Tail Handling:
/// The final partial window is zero-initialised, the valid samples are copied
/// in, and the rest of the frame fades linearly from the last valid sample down
/// to zero. Ending on abrupt silence clicks audibly; the fade does not.
///
/// Empty input yields no frames.
pub fn chunk(samples: &[i16]) -> Vec<TransportFrame> {
    samples
        .chunks(FRAME_SAMPLES)
        .map(|window| {
            let mut frame = [0i16; FRAME_SAMPLES];
            frame[..window.len()].copy_from_slice(window);
            if window.len() < FRAME_SAMPLES {
                fade_tail(&mut frame, window.len());
            }
            frame
        })
        .collect()
}

/// Ramp `frame[valid..]` from the last valid sample towards zero. Integer
/// division truncates towards zero, so magnitudes never exceed the start value.
fn fade_tail(frame: &mut TransportFrame, valid: usize) {
    let start = frame[valid - 1] as i32;
    let steps = (FRAME_SAMPLES - valid) as i32;

    for (step, slot) in frame[valid..].iter_mut().enumerate() {
        let remaining = steps - 1 - step as i32;
        *slot = (start * remaining / steps) as i16;
    }
}

/// Concatenate captured frames into one batch of exactly `target_duration_ms`
/// worth of samples at `sample_rate`.
///
/// Frames are consumed in order until the target is reached and the result is
/// truncated to it. If the frames hold less audio than the target, everything
/// is returned. Frames past the target are left untouched; the aggregator drops
/// them together with the rest of the flushed queue.
pub fn combine(frames: &[Vec<i16>], target_duration_ms: u32, sample_rate: u32) -> Vec<i16> {
    let target = (sample_rate as u64 * target_duration_ms as u64 / 1000) as usize;
    let mut batch = Vec::with_capacity(target);

    for frame in frames {
        if batch.len() >= target {
            break;
        }
        batch.extend_from_slice(frame);
    }

    batch.truncate(target);
    batch
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Vec<i16> {
        (0..len).map(|n| (n as i16).wrapping_mul(37)).collect()
    }

    #[test]
    fn test_byte_conversion_drops_odd_byte() {
        let bytes = [0x01, 0x00, 0xff, 0xff, 0x7f];
        assert_eq!(samples_from_le_bytes(&bytes), vec![1, -1]);
        assert!(samples_from_le_bytes(&[0x42]).is_empty());
        assert_eq!(samples_to_le_bytes(&[1, -1]), vec![0x01, 0x00, 0xff, 0xff]);
    }

    #[test]
    fn test_chunk_reassembles_original_prefix() {
        for len in [1usize, 479, 480, 481, 960, 1234, 4800] {
            let samples = ramp(len);
            let frames = chunk(&samples);

            assert_eq!(frames.len(), (len + FRAME_SAMPLES - 1) / FRAME_SAMPLES);
            let joined: Vec<i16> = frames.iter().flat_map(|f| f.iter().copied()).collect();
            assert_eq!(&joined[..len], &samples[..]);
        }
    }

    #[test]
    fn test_chunk_empty_input() {
        assert!(chunk(&[]).is_empty());
    }

    #[test]
    fn test_short_buffer_fades_to_zero() {
        let samples: Vec<i16> = vec![100, -200, 3000];
        let frames = chunk(&samples);
        assert_eq!(frames.len(), 1);

        let frame = &frames[0];
        assert_eq!(&frame[..3], &samples[..]);
        assert_eq!(frame[FRAME_SAMPLES - 1], 0);

        let tail = &frame[2..];
        for pair in tail.windows(2) {
            assert!((pair[1] as i32).abs() <= (pair[0] as i32).abs());
        }
        assert!(frame[3] > 0 && frame[3] < 3000);
    }

    #[test]
    fn test_negative_tail_fades_towards_zero() {
        let frames = chunk(&vec![-8000i16; 700]);
        let frame = &frames[1];
        assert_eq!(frame[219], -8000);
        assert!(frame[220] < 0);
        assert_eq!(frame[FRAME_SAMPLES - 1], 0);
        assert!(frame[220..].windows(2).all(|p| p[1] >= p[0]));
    }

    #[test]
    fn test_exact_multiple_has_no_padding() {
        let samples = vec![5i16; FRAME_SAMPLES * 2];
        let frames = chunk(&samples);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.iter().all(|&s| s == 5)));
    }

    #[test]
    fn test_combine_truncates_to_target() {
        let frames = vec![vec![1i16; 480], vec![2i16; 480], vec![3i16; 480], vec![4i16; 480]];
        let batch = combine(&frames, 30, 48_000);
        assert_eq!(batch.len(), 1440);
        assert_eq!(batch[0], 1);
        assert_eq!(batch[1439], 3);
    }

    #[test]
    fn test_combine_partial_and_empty() {
        let batch = combine(&[vec![7i16; 480]], 30, 48_000);
        assert_eq!(batch, vec![7i16; 480]);

        assert!(combine(&[], 30, 48_000).is_empty());

        let uneven = vec![vec![1i16; 1000], vec![2i16; 1000]];
        let batch = combine(&uneven, 30, 48_000);
        assert_eq!(batch.len(), 1440);
        assert_eq!(batch[999], 1);
        assert_eq!(batch[1000], 2);
    }
}
