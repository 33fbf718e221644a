//! ## Status Queues
//!
//! Serial poll bytes collected per device address, waiting to be read back
//! by the sessions open at that address.
//!

use std::collections::{HashMap, VecDeque};

use crate::error::{Error, Result};
use crate::types::Address;

/// ### Status Queue
///
/// One device's pending poll bytes and the number of sessions open on it.
///
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatusQueue {
    bytes: VecDeque<u8>,
    reference_count: usize,
    dropped_byte: bool,
}

impl StatusQueue {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn reference_count(&self) -> usize {
        self.reference_count
    }

    /// A byte was dropped since the last pop
    pub fn dropped_byte(&self) -> bool {
        self.dropped_byte
    }

    fn is_unused(&self) -> bool {
        self.reference_count == 0 && self.bytes.is_empty() && !self.dropped_byte
    }
}

/// ### Status Queues
///
/// The status queue entries of one board, keyed by device address.
///
#[derive(Debug, Clone)]
pub struct StatusQueues {
    capacity: usize,
    entries: HashMap<Address, StatusQueue>,
}

impl StatusQueues {
    pub fn new(capacity: usize) -> StatusQueues {
        StatusQueues {
            capacity: capacity.max(1),
            entries: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, address: &Address) -> Option<&StatusQueue> {
        self.entries.get(address)
    }

    /// Entry for `address`, created empty on first use
    pub fn get_or_create(&mut self, address: Address) -> &mut StatusQueue {
        self.entries.entry(address).or_default()
    }

    pub fn num_status_bytes(&self, address: &Address) -> usize {
        self.entries.get(address).map_or(0, StatusQueue::len)
    }

    /// ### Push Status Byte
    ///
    /// Queue a poll byte for `address`. When the queue is full the oldest byte
    /// is dropped and the entry flagged. Returns `true` if a byte was dropped.
    ///
    pub fn push_status_byte(&mut self, address: Address, byte: u8) -> bool {
        let capacity = self.capacity;
        let queue = self.get_or_create(address);
        let mut dropped = false;
        while queue.bytes.len() >= capacity {
            queue.bytes.pop_front();
            dropped = true;
        }
        queue.bytes.push_back(byte);
        if dropped {
            log::debug!("status queue of {address} overflowed, oldest byte dropped");
            queue.dropped_byte = true;
        }
        dropped
    }

    /// ### Pop Status Byte
    ///
    /// Oldest queued byte for `address`, or `None` when nothing is queued.
    ///
    /// If bytes were dropped since the last pop, this call reports
    /// [`Error::LostStatusByte`] once, clears the flag and leaves the queue
    /// untouched; the next pop returns the oldest surviving byte.
    ///
    pub fn pop_status_byte(&mut self, address: &Address) -> Result<Option<u8>> {
        let Some(queue) = self.entries.get_mut(address) else {
            return Ok(None);
        };
        if queue.dropped_byte {
            queue.dropped_byte = false;
            return Err(Error::LostStatusByte);
        }
        let byte = queue.bytes.pop_front();
        self.remove_if_unused(address);
        Ok(byte)
    }

    /// Register one more session at `address`
    pub fn increment_open_count(&mut self, address: Address) {
        self.get_or_create(address).reference_count += 1;
    }

    /// ### Decrement Open Count
    ///
    /// Release one session at `address`. The entry goes away once no session
    /// refers to it and its queue is empty.
    ///
    pub fn decrement_open_count(&mut self, address: &Address) -> Result<()> {
        self.subtract_open_count(address, 1)
    }

    /// Release `count` sessions at `address` at once
    pub fn subtract_open_count(&mut self, address: &Address, count: usize) -> Result<()> {
        let queue = self
            .entries
            .get_mut(address)
            .ok_or(Error::NonexistentDevice)?;
        if queue.reference_count < count {
            return Err(Error::InvalidArgument("open count would go negative"));
        }
        queue.reference_count -= count;
        self.remove_if_unused(address);
        Ok(())
    }

    pub fn reference_count(&self, address: &Address) -> usize {
        self.entries.get(address).map_or(0, StatusQueue::reference_count)
    }

    /// Addresses with at least one open session, in address order
    pub fn open_addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self
            .entries
            .iter()
            .filter(|(_, queue)| queue.reference_count > 0)
            .map(|(address, _)| *address)
            .collect();
        addresses.sort();
        addresses
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_if_unused(&mut self, address: &Address) {
        if self.entries.get(address).is_some_and(StatusQueue::is_unused) {
            self.entries.remove(address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(pad: i32) -> Address {
        Address::new(pad, -1).unwrap()
    }

    #[test]
    fn queue_is_fifo() {
        let mut queues = StatusQueues::new(16);
        queues.increment_open_count(addr(5));
        for byte in [0x41, 0x42, 0x43] {
            queues.push_status_byte(addr(5), byte);
        }
        assert_eq!(queues.num_status_bytes(&addr(5)), 3);
        assert_eq!(queues.pop_status_byte(&addr(5)), Ok(Some(0x41)));
        assert_eq!(queues.pop_status_byte(&addr(5)), Ok(Some(0x42)));
        assert_eq!(queues.pop_status_byte(&addr(5)), Ok(Some(0x43)));
        assert_eq!(queues.pop_status_byte(&addr(5)), Ok(None));
        assert_eq!(queues.pop_status_byte(&addr(9)), Ok(None));
    }

    #[test]
    fn overflow_keeps_newest_and_flags_once() {
        let mut queues = StatusQueues::new(16);
        queues.increment_open_count(addr(1));
        let dropped: Vec<bool> = (0..20u8)
            .map(|byte| queues.push_status_byte(addr(1), byte))
            .collect();
        assert_eq!(dropped.iter().filter(|d| **d).count(), 4);
        assert!(queues.get(&addr(1)).unwrap().dropped_byte());
        assert_eq!(queues.num_status_bytes(&addr(1)), 16);

        assert_eq!(queues.pop_status_byte(&addr(1)), Err(Error::LostStatusByte));
        assert!(!queues.get(&addr(1)).unwrap().dropped_byte());
        let rest: Vec<u8> = std::iter::from_fn(|| queues.pop_status_byte(&addr(1)).unwrap()).collect();
        assert_eq!(rest, (4..20u8).collect::<Vec<_>>());
    }

    #[test]
    fn reference_counting() {
        let mut queues = StatusQueues::new(16);
        queues.increment_open_count(addr(3));
        queues.increment_open_count(addr(3));
        queues.decrement_open_count(&addr(3)).unwrap();
        assert_eq!(queues.reference_count(&addr(3)), 1);
        assert!(queues.get(&addr(3)).is_some());

        queues.push_status_byte(addr(3), 0x50);
        queues.decrement_open_count(&addr(3)).unwrap();
        // still holds a byte
        assert!(queues.get(&addr(3)).is_some());
        assert_eq!(queues.pop_status_byte(&addr(3)), Ok(Some(0x50)));
        assert!(queues.get(&addr(3)).is_none());
    }

    #[test]
    fn count_never_goes_negative() {
        let mut queues = StatusQueues::new(4);
        assert_eq!(
            queues.decrement_open_count(&addr(2)),
            Err(Error::NonexistentDevice)
        );
        queues.increment_open_count(addr(2));
        assert!(queues.subtract_open_count(&addr(2), 2).is_err());
        assert_eq!(queues.reference_count(&addr(2)), 1);
        queues.subtract_open_count(&addr(2), 1).unwrap();
        assert!(queues.is_empty());
    }

    #[test]
    fn open_addresses_are_sorted() {
        let mut queues = StatusQueues::new(4);
        queues.increment_open_count(addr(12));
        queues.increment_open_count(Address::new(3, 4).unwrap());
        queues.increment_open_count(addr(3));
        queues.push_status_byte(addr(20), 0x40);
        assert_eq!(
            queues.open_addresses(),
            vec![addr(3), Address::new(3, 4).unwrap(), addr(12)]
        );
    }
}
