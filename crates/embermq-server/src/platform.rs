//! Clock and entropy hooks consumed by the engine.
//!
//! The broker never reads the system clock directly; everything time-
//! related goes through a `Platform` so tests can pin both clocks and
//! drive expiry deterministically.

use std::cell::Cell;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::rc::Rc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Monotonic and wall clocks plus id-generation entropy.
pub trait Platform {
    /// Seconds from an arbitrary, monotonically increasing origin.
    fn now_mono(&self) -> u64;

    /// Wall-clock seconds since the Unix epoch.
    fn now_wall(&self) -> u64;

    /// Fill `buf` with bytes suitable for client-id generation. Not
    /// required to be cryptographically strong.
    fn random_bytes(&self, buf: &mut [u8]);
}

/// Production implementation over `Instant`/`SystemTime`.
pub struct SystemPlatform {
    start: Instant,
    hasher: RandomState,
    counter: Cell<u64>,
}

impl SystemPlatform {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            hasher: RandomState::new(),
            counter: Cell::new(0),
        }
    }
}

impl Default for SystemPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SystemPlatform {
    fn now_mono(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    fn now_wall(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn random_bytes(&self, buf: &mut [u8]) {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        for chunk in buf.chunks_mut(8) {
            self.counter.set(self.counter.get().wrapping_add(1));
            let mut h = self.hasher.build_hasher();
            h.write_u32(nanos);
            h.write_u64(self.counter.get());
            let word = h.finish().to_be_bytes();
            let n = chunk.len();
            chunk.copy_from_slice(&word[..n]);
        }
    }
}

/// Deterministic platform for tests: both clocks are plain cells the
/// test advances by hand.
pub struct ManualPlatform {
    pub mono: Cell<u64>,
    pub wall: Cell<u64>,
    counter: Cell<u64>,
}

impl ManualPlatform {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            mono: Cell::new(0),
            wall: Cell::new(1_000_000),
            counter: Cell::new(0),
        })
    }

    pub fn advance(&self, secs: u64) {
        self.mono.set(self.mono.get() + secs);
        self.wall.set(self.wall.get() + secs);
    }
}

impl Platform for Rc<ManualPlatform> {
    fn now_mono(&self) -> u64 {
        self.mono.get()
    }

    fn now_wall(&self) -> u64 {
        self.wall.get()
    }

    fn random_bytes(&self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            self.counter.set(self.counter.get().wrapping_add(1));
            *b = (self.counter.get() & 0xFF) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_platform_mono_starts_at_zero() {
        let p = SystemPlatform::new();
        assert!(p.now_mono() < 2);
        assert!(p.now_wall() > 1_600_000_000);
    }

    #[test]
    fn test_random_bytes_fills_buffer() {
        let p = SystemPlatform::new();
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        p.random_bytes(&mut a);
        p.random_bytes(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_manual_platform_advance() {
        let p = ManualPlatform::new();
        let start_wall = p.wall.get();
        p.advance(30);
        assert_eq!(p.mono.get(), 30);
        assert_eq!(p.wall.get(), start_wall + 30);
    }
}
