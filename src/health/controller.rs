//! Single filtered health signal.
//!
//! Values are f64 stored as bit patterns in `AtomicU64` so every update is
//! a lock-free CAS loop; concurrent completions race and the loser retries
//! against the latest value. An unseeded filter holds NaN, so whichever
//! sample commits first seeds it inside the same CAS.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// An `f64` with atomic load/store/update.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    /// Apply `f` atomically, returning the committed value.
    pub fn update<F>(&self, f: F) -> f64
    where
        F: Fn(f64) -> f64,
    {
        let mut current_bits = self.0.load(Ordering::Acquire);
        loop {
            let next = f(f64::from_bits(current_bits));
            match self.0.compare_exchange_weak(
                current_bits,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(updated_bits) => current_bits = updated_bits,
            }
        }
    }
}

/// Exponentially filtered signal with a server-observed and a
/// load-balance-adjusted track.
#[derive(Debug)]
pub struct HealthController {
    server_value: AtomicF64,
    lb_value: AtomicF64,
    valid: AtomicBool,
    version: AtomicU64,
}

impl Default for HealthController {
    fn default() -> Self {
        Self {
            server_value: AtomicF64::new(f64::NAN),
            lb_value: AtomicF64::new(f64::NAN),
            valid: AtomicBool::new(false),
            version: AtomicU64::new(0),
        }
    }
}

impl HealthController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one sample into both tracks.
    ///
    /// The first committed sample seeds the filters directly. Returns the new version.
    pub fn update(&self, server_sample: f64, lb_sample: f64, alpha: f64, min_valid_samples: u64) -> u64 {
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;

        self.server_value.update(|old| ewma(old, server_sample, alpha));
        self.lb_value.update(|old| ewma(old, lb_sample, alpha));

        if version >= min_valid_samples && !self.valid.load(Ordering::Acquire) {
            self.valid.store(true, Ordering::Release);
        }
        version
    }

    pub fn server_value(&self) -> f64 {
        seeded_or_zero(self.server_value.load())
    }

    pub fn lb_value(&self) -> f64 {
        seeded_or_zero(self.lb_value.load())
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

#[inline]
fn ewma(old: f64, sample: f64, alpha: f64) -> f64 {
    if old.is_nan() {
        return sample;
    }
    old * (1.0 - alpha) + sample * alpha
}

#[inline]
fn seeded_or_zero(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value }
}
