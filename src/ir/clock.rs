use std::cell::{Cell, RefCell};
use std::rc::Rc;
use uuid::Uuid;

use crate::error::Error;
use crate::object::FreezeFlag;

/// Metadata for one clock: every integer field class mapped to a clock
/// class contributes samples to a single 64-bit cycle counter per
/// decoder (see the decoder's clock update rules).
#[derive(Debug)]
pub struct ClockClass {
    freeze: FreezeFlag,
    name: String,
    description: RefCell<Option<String>>,
    frequency: Cell<u64>,
    precision: Cell<u64>,
    offset_seconds: Cell<i64>,
    offset_cycles: Cell<u64>,
    is_absolute: Cell<bool>,
    uuid: RefCell<Option<Uuid>>,
}

impl ClockClass {
    /// New clock class with the given name and frequency in Hz.
    pub fn new(name: impl Into<String>, frequency: u64) -> Rc<Self> {
        Rc::new(Self {
            freeze: FreezeFlag::new(),
            name: name.into(),
            description: RefCell::new(None),
            frequency: Cell::new(frequency),
            precision: Cell::new(0),
            offset_seconds: Cell::new(0),
            offset_cycles: Cell::new(0),
            is_absolute: Cell::new(false),
            uuid: RefCell::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<String> {
        self.description.borrow().clone()
    }

    pub fn set_description(&self, description: impl Into<String>) -> Result<(), Error> {
        self.freeze.check_hot("clock class")?;
        *self.description.borrow_mut() = Some(description.into());
        Ok(())
    }

    pub fn frequency(&self) -> u64 {
        self.frequency.get()
    }

    pub fn set_frequency(&self, frequency: u64) -> Result<(), Error> {
        self.freeze.check_hot("clock class")?;
        if frequency == 0 {
            return Err(Error::Metadata("clock frequency cannot be zero".into()));
        }
        self.frequency.set(frequency);
        Ok(())
    }

    pub fn precision(&self) -> u64 {
        self.precision.get()
    }

    pub fn set_precision(&self, precision: u64) -> Result<(), Error> {
        self.freeze.check_hot("clock class")?;
        self.precision.set(precision);
        Ok(())
    }

    /// Offset from the clock origin as whole seconds plus cycles.
    pub fn offset(&self) -> (i64, u64) {
        (self.offset_seconds.get(), self.offset_cycles.get())
    }

    pub fn set_offset(&self, seconds: i64, cycles: u64) -> Result<(), Error> {
        self.freeze.check_hot("clock class")?;
        self.offset_seconds.set(seconds);
        self.offset_cycles.set(cycles);
        Ok(())
    }

    pub fn is_absolute(&self) -> bool {
        self.is_absolute.get()
    }

    pub fn set_is_absolute(&self, is_absolute: bool) -> Result<(), Error> {
        self.freeze.check_hot("clock class")?;
        self.is_absolute.set(is_absolute);
        Ok(())
    }

    pub fn uuid(&self) -> Option<Uuid> {
        *self.uuid.borrow()
    }

    pub fn set_uuid(&self, uuid: Uuid) -> Result<(), Error> {
        self.freeze.check_hot("clock class")?;
        *self.uuid.borrow_mut() = Some(uuid);
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze.is_frozen()
    }

    pub fn freeze(&self) {
        self.freeze.freeze();
    }

    /// Converts a raw cycle count into nanoseconds from the clock's
    /// origin, applying the seconds + cycles offset.
    pub fn cycles_to_ns_from_origin(&self, cycles: u64) -> i64 {
        let freq = self.frequency.get();
        let total_cycles = cycles.wrapping_add(self.offset_cycles.get());
        let ns = if freq == 1_000_000_000 {
            total_cycles as i64
        } else {
            ((total_cycles as f64) * 1_000_000_000.0 / freq as f64) as i64
        };
        self.offset_seconds
            .get()
            .saturating_mul(1_000_000_000)
            .saturating_add(ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ns_from_origin_applies_offsets() {
        let cc = ClockClass::new("monotonic", 1_000_000_000);
        cc.set_offset(2, 500).unwrap();
        assert_eq!(cc.cycles_to_ns_from_origin(1_000), 2_000_000_000 + 1_500);
    }

    #[test]
    fn ns_from_origin_scales_frequency() {
        let cc = ClockClass::new("tick", 1_000_000);
        // 1 MHz: one cycle is 1000 ns.
        assert_eq!(cc.cycles_to_ns_from_origin(10), 10_000);
    }

    #[test]
    fn frozen_clock_class_refuses_mutation() {
        let cc = ClockClass::new("c", 1_000);
        cc.freeze();
        assert!(cc.set_frequency(2_000).is_err());
        assert!(cc.set_is_absolute(true).is_err());
        // Idempotent.
        cc.freeze();
        assert!(cc.is_frozen());
    }
}
