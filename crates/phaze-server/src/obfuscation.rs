//! Optional traffic-shape obfuscation for data payloads.
//!
//! This only disguises payload lengths. It adds no confidentiality or
//! integrity; the AEAD layer underneath provides both.

use rand::Rng;

/// Reversible transform applied to sealed data payloads.
pub trait Obfuscator: Send + Sync {
    fn obfuscate(&self, payload: &[u8]) -> Vec<u8>;

    /// Undo `obfuscate`; `None` if the input could not have come from it.
    fn deobfuscate(&self, payload: &[u8]) -> Option<Vec<u8>>;

    /// Worst-case number of bytes added by `obfuscate`.
    fn overhead(&self) -> usize;
}

/// Appends up to `max_padding` random bytes followed by a one-byte padding
/// length, never growing a payload past `limit`.
#[derive(Debug, Clone)]
pub struct PaddingObfuscator {
    max_padding: u8,
    limit: usize,
}

impl PaddingObfuscator {
    pub const DEFAULT_MAX_PADDING: u8 = 64;

    pub fn new(max_padding: u8, limit: usize) -> Self {
        Self { max_padding, limit }
    }
}

impl Obfuscator for PaddingObfuscator {
    fn obfuscate(&self, payload: &[u8]) -> Vec<u8> {
        let room = self.limit.saturating_sub(payload.len() + 1);
        let max = usize::from(self.max_padding).min(room);

        let mut rng = rand::thread_rng();
        let padding = rng.gen_range(0..=max);

        let mut out = Vec::with_capacity(payload.len() + padding + 1);
        out.extend_from_slice(payload);
        out.extend((0..padding).map(|_| rng.gen::<u8>()));
        out.push(padding as u8);
        out
    }

    fn deobfuscate(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let (&padding, rest) = payload.split_last()?;
        let padding = usize::from(padding);
        if padding > usize::from(self.max_padding) || padding > rest.len() {
            return None;
        }
        Some(rest[..rest.len() - padding].to_vec())
    }

    fn overhead(&self) -> usize {
        usize::from(self.max_padding) + 1
    }
}
