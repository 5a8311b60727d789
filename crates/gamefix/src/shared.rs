use std::sync::atomic::{AtomicU32, Ordering};

/// An `f32` that hook callbacks on any thread can read and update.
///
/// Typical use is a value computed once at setup (the new FOV) or captured
/// by one hook and consumed by another (the aspect ratio the game is
/// currently rendering at).
#[derive(Debug, Default)]
pub struct SharedF32(AtomicU32);

impl SharedF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    /// Apply `f` atomically and return the new value.
    pub fn update<F: Fn(f32) -> f32>(&self, f: F) -> f32 {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = f(f32::from_bits(current)).to_bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return f32::from_bits(next),
                Err(actual) => current = actual,
            }
        }
    }
}
