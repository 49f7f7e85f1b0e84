//! Sliding-window replay protection for transport counters.
//!
//! Tracks the highest counter accepted so far plus a 128-bit bitmap of the
//! counters just below it. Out-of-order delivery inside the window is
//! accepted once; anything older than the window, or already seen, is not.
//!
//! `check` runs before decryption and has no side effects; `commit` runs only
//! after the AEAD tag verified, so forged frames cannot advance the window.

use crate::error::CryptoError;

pub const WINDOW_SIZE: u64 = 128;

#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    highest: Option<u64>,
    bitmap: u128,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn highest(&self) -> Option<u64> {
        self.highest
    }

    pub fn check(&self, counter: u64) -> Result<(), CryptoError> {
        let Some(highest) = self.highest else {
            return Ok(());
        };
        if counter > highest {
            return Ok(());
        }
        let offset = highest - counter;
        if offset >= WINDOW_SIZE {
            return Err(CryptoError::ReplayRejected(counter));
        }
        if self.bitmap & (1u128 << offset) != 0 {
            return Err(CryptoError::ReplayRejected(counter));
        }
        Ok(())
    }

    /// Record `counter` as received. Callers must `check` first.
    pub fn commit(&mut self, counter: u64) {
        match self.highest {
            None => {
                self.highest = Some(counter);
                self.bitmap = 1;
            }
            Some(highest) if counter > highest => {
                let shift = counter - highest;
                self.bitmap = if shift >= WINDOW_SIZE {
                    0
                } else {
                    self.bitmap << shift
                };
                self.bitmap |= 1;
                self.highest = Some(counter);
            }
            Some(highest) => {
                let offset = highest - counter;
                if offset < WINDOW_SIZE {
                    self.bitmap |= 1u128 << offset;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_exact_duplicate() {
        let mut w = ReplayWindow::new();
        w.check(0).unwrap();
        w.commit(0);
        assert!(matches!(w.check(0), Err(CryptoError::ReplayRejected(0))));
    }

    #[test]
    fn accepts_reordered_within_window_once() {
        let mut w = ReplayWindow::new();
        for n in [5u64, 3, 4, 10] {
            w.check(n).unwrap();
            w.commit(n);
        }
        assert!(w.check(6).is_ok());
        assert!(w.check(3).is_err());
        assert!(w.check(10).is_err());
        assert_eq!(w.highest(), Some(10));
    }

    #[test]
    fn rejects_counters_below_window_floor() {
        let mut w = ReplayWindow::new();
        w.commit(1);
        w.commit(1 + WINDOW_SIZE);
        assert!(w.check(1).is_err());
        assert!(w.check(2).is_ok());
    }

    #[test]
    fn large_jump_clears_bitmap() {
        let mut w = ReplayWindow::new();
        w.commit(0);
        w.commit(1_000);
        assert!(w.check(999).is_ok());
        assert!(w.check(1_000).is_err());
    }
}
