//! Sequence-number arithmetic on the 16-bit RTP ring.
//!
//! Plain integer comparison misorders keys near the 65535 -> 0 wrap, so every
//! ordering decision on sequence numbers goes through these helpers.

/// Signed distance from `from` to `to`, reduced to `[-32768, 32767]`.
pub fn seq_delta(from: u16, to: u16) -> i16 {
    to.wrapping_sub(from) as i16
}

/// Magnitude of the shorter way around the ring between `a` and `b`.
pub fn seq_distance(a: u16, b: u16) -> u16 {
    seq_delta(a, b).unsigned_abs()
}

/// `true` when `seq` lies strictly behind `reference` on the ring.
pub fn seq_is_behind(seq: u16, reference: u16) -> bool {
    seq_delta(reference, seq) < 0
}

/// Key closest to `target` under modular distance. On a tie the key ahead of
/// `target` wins so a resync never rewinds when it can move forward.
pub fn closest_seq<I>(target: u16, keys: I) -> Option<u16>
where
    I: IntoIterator<Item = u16>,
{
    keys.into_iter().min_by_key(|&k| {
        let delta = seq_delta(target, k);
        (delta.unsigned_abs(), delta < 0)
    })
}

/// Key furthest behind `reference` (smallest signed delta); the natural
/// playout start among a set of buffered keys.
pub fn earliest_seq<I>(reference: u16, keys: I) -> Option<u16>
where
    I: IntoIterator<Item = u16>,
{
    keys.into_iter().min_by_key(|&k| seq_delta(reference, k))
}
