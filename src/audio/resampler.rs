//! # Sample-Rate Conversion
//!
//! Converts 16-bit mono PCM between the transport rate (48 kHz) and the voice
//! service rate (24.1 kHz).
//!
//! ## Ratio:
//! 48000 / 24100 reduces to 480 / 241. Every source position is computed from
//! that exact fraction for each output index (`i * 480 / 241`, split into an
//! integer part and a remainder) instead of stepping a float accumulator, so
//! positions stay exact no matter how long the stream runs.
//!
//! ## Key Functions:
//! - **downsample**: 48 kHz → 24.1 kHz with a 4-tap binomial anti-aliasing filter
//! - **upsample**: 24.1 kHz → 48 kHz with plain linear interpolation

/// Sample rate of the real-time transport (Hz)
pub const TRANSPORT_SAMPLE_RATE: u32 = 48_000;

/// Sample rate accepted and produced by the voice service (Hz)
pub const VOICE_SAMPLE_RATE: u32 = 24_100;

/// 48000 / 24100 in lowest terms
const RATIO_NUM: u64 = 480;
const RATIO_DEN: u64 = 241;

/// Binomial [1, 3, 3, 1] / 8 low-pass kernel. Applied at base index `k` it
/// covers `k - 1 ..= k + 2` and is centred on `k + 0.5`.
const LOW_PASS_TAPS: [f64; 4] = [0.125, 0.375, 0.375, 0.125];

/// Number of 24.1 kHz samples produced from `len` 48 kHz samples (rounded).
pub fn downsampled_len(len: usize) -> usize {
    ((len as u64 * RATIO_DEN + RATIO_NUM / 2) / RATIO_NUM) as usize
}

/// Number of 48 kHz samples produced from `len` 24.1 kHz samples (rounded).
pub fn upsampled_len(len: usize) -> usize {
    ((len as u64 * RATIO_NUM + RATIO_DEN / 2) / RATIO_DEN) as usize
}

/// Convert 48 kHz PCM to 24.1 kHz.
///
/// ## Method:
/// 1. Source position for output `i` is `i * 480 / 241`
/// 2. The low-pass kernel is evaluated at the two integer bases bracketing that
///    position (shifted by the kernel's half-sample centre)
/// 3. The two filtered values are linearly interpolated
///
/// Neighbour indices clamp to the buffer bounds. Empty input returns empty output.
pub fn downsample(input: &[i16]) -> Vec<i16> {
    if input.is_empty() {
        return Vec::new();
    }

    let last = input.len() - 1;
    let out_len = downsampled_len(input.len());
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let pos = source_position(i, RATIO_NUM, RATIO_DEN) - 0.5;
        let base = pos.floor();
        let frac = pos - base;
        let base = base as i64;

        let current = filtered_at(input, base, last);
        let next = filtered_at(input, base + 1, last);
        output.push(clip(current + (next - current) * frac));
    }

    output
}

/// Convert 24.1 kHz PCM to 48 kHz.
///
/// Source position for output `i` is `i * 241 / 480`; the result is the linear
/// interpolation of the two bracketing samples, with the upper neighbour
/// clamped to the last valid sample. Empty input returns empty output.
pub fn upsample(input: &[i16]) -> Vec<i16> {
    if input.is_empty() {
        return Vec::new();
    }

    let last = input.len() - 1;
    let out_len = upsampled_len(input.len());
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let pos = source_position(i, RATIO_DEN, RATIO_NUM);
        let whole = pos.floor();
        let frac = pos - whole;
        let idx = (whole as usize).min(last);

        let current = input[idx] as f64;
        let next = input[(idx + 1).min(last)] as f64;
        output.push(clip(current + (next - current) * frac));
    }

    output
}

/// Exact `index * num / den` as a float: integer part from integer division,
/// fraction from the remainder.
fn source_position(index: usize, num: u64, den: u64) -> f64 {
    let scaled = index as u64 * num;
    (scaled / den) as f64 + (scaled % den) as f64 / den as f64
}

fn filtered_at(input: &[i16], base: i64, last: usize) -> f64 {
    LOW_PASS_TAPS
        .iter()
        .enumerate()
        .map(|(tap, weight)| {
            let idx = (base - 1 + tap as i64).clamp(0, last as i64) as usize;
            weight * input[idx] as f64
        })
        .sum()
}

/// Round to nearest and clamp into the i16 range.
fn clip(value: f64) -> i16 {
    value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}
