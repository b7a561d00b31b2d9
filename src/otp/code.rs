//! One-time code generation.

use rand::{Rng, rngs::OsRng};

/// Source of one-time codes.
pub trait CodeGenerator: Send + Sync {
    fn generate(&self, length: usize) -> String;
}

/// Uniform decimal digits drawn independently from the OS RNG; repeats allowed.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomDigits;

impl CodeGenerator for RandomDigits {
    fn generate(&self, length: usize) -> String {
        let mut rng = OsRng;
        (0..length)
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect()
    }
}
