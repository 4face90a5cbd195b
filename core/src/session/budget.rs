// Copyright (c) 2022-2023 The MobileCoin Foundation

use crate::{
    card::{BufferUnit, ModificationsBuffer},
    error::Error,
};

/// Per-command overhead in byte mode
pub const COMMAND_OVERHEAD: usize = 6;

/// Session modifications buffer budget
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ModificationBudget {
    buffer: ModificationsBuffer,
    used: usize,
}

impl ModificationBudget {
    pub fn new(buffer: ModificationsBuffer) -> Self {
        Self { buffer, used: 0 }
    }

    /// Cost of a modifying command with the provided payload
    pub fn cost(&self, payload: usize) -> usize {
        match self.buffer.unit {
            BufferUnit::Bytes => payload + COMMAND_OVERHEAD,
            BufferUnit::Commands => 1,
        }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.capacity.saturating_sub(self.used)
    }

    /// Check whether the provided cost fits in the remaining budget
    pub fn check(&self, cost: usize) -> Result<(), Error> {
        match cost <= self.remaining() {
            true => Ok(()),
            false => Err(Error::SessionBufferOverflow {
                required: cost,
                available: self.remaining(),
            }),
        }
    }

    /// Check whether the provided cost could ever fit in an empty buffer
    pub fn fits_empty(&self, cost: usize) -> bool {
        cost <= self.buffer.capacity
    }

    pub fn consume(&mut self, cost: usize) {
        self.used += cost;
    }

    /// Reset for a new session
    pub fn reset(&mut self) {
        self.used = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn byte_budget() {
        let mut b = ModificationBudget::new(ModificationsBuffer {
            unit: BufferUnit::Bytes,
            capacity: 100,
        });

        let c = b.cost(29);
        assert_eq!(c, 35);

        b.check(c).unwrap();
        b.consume(c);
        b.check(c).unwrap();
        b.consume(c);
        assert_eq!(b.remaining(), 30);

        assert_eq!(
            b.check(c),
            Err(Error::SessionBufferOverflow {
                required: 35,
                available: 30
            })
        );
        assert!(b.fits_empty(c));
        assert!(!b.fits_empty(b.cost(95)));

        b.reset();
        assert_eq!(b.remaining(), 100);
    }

    #[test]
    fn command_budget() {
        let mut b = ModificationBudget::new(ModificationsBuffer {
            unit: BufferUnit::Commands,
            capacity: 2,
        });

        assert_eq!(b.cost(200), 1);
        b.consume(1);
        b.consume(1);
        assert!(b.check(1).is_err());
    }
}
