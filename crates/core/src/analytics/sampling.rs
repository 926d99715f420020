//! Deterministic per-session sampling.

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// 32-bit FNV-1a over the UTF-16 code units of `session_id`, scaled to `[0, 1]`
pub fn sample_value(session_id: &str) -> f64 {
    let hash = session_id.encode_utf16().fold(FNV_OFFSET_BASIS, |hash, unit| {
        (hash ^ u32::from(unit)).wrapping_mul(FNV_PRIME)
    });
    (f64::from(hash) / f64::from(u32::MAX)).clamp(0.0, 1.0)
}

/// Whether a session falls inside a sample of `rate`
pub fn is_sampled(session_id: &str, rate: f64) -> bool {
    sample_value(session_id) <= rate
}
