//! Box-average sample rate conversion
//!
//! Each output sample is the mean of the input samples that fall into its
//! proportional bucket. This is not a band-limited resampler; it trades
//! quality for a fixed, tiny per-block cost inside the capture callback.

/// Convert one float sample to PCM16 with saturation
#[inline]
pub fn float_to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Convert a block of float samples to PCM16
pub fn to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| float_to_pcm16(s)).collect()
}

/// Number of output samples produced for `input_len` samples
pub fn output_len(input_len: usize, source_rate: u32, target_rate: u32) -> usize {
    if source_rate == target_rate {
        return input_len;
    }
    let ratio = source_rate as f64 / target_rate as f64;
    (input_len as f64 / ratio).round() as usize
}

/// Resample in the float domain
pub fn resample_f32(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || source_rate == 0 || target_rate == 0 {
        return samples.to_vec();
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let len = output_len(samples.len(), source_rate, target_rate);
    let mut out = Vec::with_capacity(len);

    let mut cursor = 0usize;
    let mut previous = 0.0f32;
    for i in 0..len {
        let boundary = (((i + 1) as f64 * ratio).round() as usize).min(samples.len());
        let bucket = &samples[cursor.min(boundary)..boundary];
        // Empty buckets only happen when upsampling; hold the last value.
        let value = if bucket.is_empty() {
            previous
        } else {
            bucket.iter().sum::<f32>() / bucket.len() as f32
        };
        out.push(value);
        previous = value;
        cursor = cursor.max(boundary);
    }

    out
}

/// Resample a mono float block from `source_rate` to `target_rate` as PCM16
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if source_rate == target_rate {
        return to_pcm16(samples);
    }
    to_pcm16(&resample_f32(samples, source_rate, target_rate))
}
