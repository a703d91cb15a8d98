use std::marker::PhantomData;

use rustc_hash::FxHashSet;
use tracing::{debug, trace};

use crate::error::{BdtError, BdtResult};
use crate::util::random::{Random, RngRandom};

/// A number space of ids (virtual ports, session ids) handed out from a rolling counter that
///  starts at a random position and wraps around inside `[min, max]`. Values outside that range
///  can still be reserved explicitly.
pub struct IdAllocator<R: Random> {
    min: u32,
    max: u32,
    next: u32,
    used: FxHashSet<u32>,
    _random: PhantomData<R>,
}

impl IdAllocator<RngRandom> {
    pub fn new(min: u32, max: u32) -> IdAllocator<RngRandom> {
        Self::new_with_random(min, max)
    }
}

impl <R: Random> IdAllocator<R> {
    pub fn new_with_random(min: u32, max: u32) -> IdAllocator<R> {
        assert!(min <= max);
        assert!(min > 0, "0 is never a valid id");

        let span = max - min + 1;
        IdAllocator {
            min,
            max,
            next: min + R::gen_u32_range(0..span),
            used: FxHashSet::default(),
            _random: PhantomData,
        }
    }

    fn span(&self) -> u64 {
        (self.max - self.min) as u64 + 1
    }

    pub fn allocate(&mut self) -> BdtResult<u32> {
        let in_range = self.used.iter()
            .filter(|v| **v >= self.min && **v <= self.max)
            .count() as u64;
        if in_range >= self.span() {
            debug!("id space [{}, {}] exhausted", self.min, self.max);
            return Err(BdtError::TooMuchConnection);
        }

        loop {
            let candidate = self.next;
            self.next = if self.next == self.max { self.min } else { self.next + 1 };

            if self.used.insert(candidate) {
                trace!("allocated id {}", candidate);
                return Ok(candidate);
            }
        }
    }

    /// claims a specific value
    pub fn reserve(&mut self, value: u32) -> BdtResult<()> {
        if value == 0 {
            return Err(BdtError::InvalidArgs);
        }
        if !self.used.insert(value) {
            debug!("id {} is already in use", value);
            return Err(BdtError::Conflict);
        }
        Ok(())
    }

    pub fn release(&mut self, value: u32) -> bool {
        self.used.remove(&value)
    }

    pub fn is_used(&self, value: u32) -> bool {
        self.used.contains(&value)
    }
}
