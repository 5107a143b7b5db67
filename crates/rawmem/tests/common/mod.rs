// Shared helpers for the rawmem integration tests.
//
// Provides a small deterministic generator for property-style loops and a
// private ledger for tests that assert exact counts.

#![allow(dead_code)]

use rawmem::ledger::Ledger;

/// Number of generated cases per property.
pub const CASES: usize = 256;

/// xorshift64* generator. Deterministic per seed so failures reproduce.
pub struct Rng(u64);

impl Rng {
    pub fn new(seed: u64) -> Self {
        Rng(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    /// Uniform-ish value in `0..bound`.
    pub fn below(&mut self, bound: usize) -> usize {
        (self.next_u64() % bound as u64) as usize
    }

    pub fn chance(&mut self, percent: usize) -> bool {
        self.below(100) < percent
    }

    /// Arbitrary UTF-16, including surrogate pairs and unpaired surrogates.
    pub fn utf16(&mut self, max_len: usize) -> Vec<u16> {
        let len = self.below(max_len + 1);
        let mut units = Vec::with_capacity(len + 1);
        while units.len() < len {
            match self.below(5) {
                0 => units.push(self.below(0x80) as u16),
                1 => units.push(0x80 + self.below(0x780) as u16),
                2 => units.push(0xE000 + self.below(0x2000) as u16),
                3 => {
                    let cp = 0x1_0000 + self.below(0x10_0000) as u32;
                    let mut buf = [0u16; 2];
                    if let Some(ch) = char::from_u32(cp) {
                        units.extend_from_slice(ch.encode_utf16(&mut buf));
                    }
                }
                _ => units.push(0xD800 + self.below(0x800) as u16),
            }
        }
        units
    }
}

/// A ledger private to one test, so counts are not disturbed by others.
pub fn private_ledger() -> &'static Ledger {
    Box::leak(Box::new(Ledger::new()))
}

/// UTF-16 units of `text`.
pub fn utf16(text: &str) -> Vec<u16> {
    text.encode_utf16().collect()
}
