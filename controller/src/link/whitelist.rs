//! Device whitelist used by the advertising filter policy.

use heapless::Vec;

use super::address::{is_random_kind, AddrKind, BdAddr};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    random: bool,
    addr: BdAddr,
}

/// Whitelist with room for `N` devices.
pub struct Whitelist<const N: usize> {
    entries: Vec<Entry, N>,
}

impl<const N: usize> Default for Whitelist<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Whitelist<N> {
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Add a device. Adding a device already on the list has no effect.
    pub fn add(&mut self, addr: BdAddr, random: bool) -> Result<(), Error> {
        let entry = Entry { random, addr };
        if self.entries.contains(&entry) {
            return Ok(());
        }
        self.entries.push(entry).map_err(|_| Error::MemCapacity)
    }

    /// Remove a device. Returns `false` if it was not on the list.
    pub fn remove(&mut self, addr: BdAddr, random: bool) -> bool {
        let entry = Entry { random, addr };
        match self.entries.iter().position(|e| *e == entry) {
            Some(pos) => {
                self.entries.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries the list can hold.
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Whether a device may pass the filter.
    ///
    /// `random` follows the TxAdd bit of the PDU, or the identity address type when the address
    /// was resolved.
    pub fn contains(&self, addr: &BdAddr, random: bool) -> bool {
        self.entries.iter().any(|e| e.random == random && e.addr == *addr)
    }

    /// Like [`Whitelist::contains`] with a resolving list identity type.
    pub fn contains_identity(&self, addr: &BdAddr, kind: AddrKind) -> bool {
        self.contains(addr, is_random_kind(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_match() {
        let mut wl: Whitelist<2> = Whitelist::new();
        let a = BdAddr::new([1, 2, 3, 4, 5, 6]);
        let b = BdAddr::new([6, 5, 4, 3, 2, 1]);
        wl.add(a, false).unwrap();
        wl.add(a, false).unwrap();
        assert_eq!(wl.len(), 1);
        wl.add(a, true).unwrap();
        assert_eq!(wl.add(b, false), Err(Error::MemCapacity));

        assert!(wl.contains(&a, false));
        assert!(wl.contains(&a, true));
        assert!(!wl.contains(&b, false));

        assert!(wl.remove(a, true));
        assert!(!wl.remove(a, true));
        assert!(!wl.contains(&a, true));
        wl.clear();
        assert!(wl.is_empty());
    }
}
