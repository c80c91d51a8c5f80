//! Resolving list and resolvable private addresses.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use embassy_time::Duration;
use heapless::Vec;
use rand_core::RngCore;

use super::address::{is_rpa, AddrKind, Address, BdAddr};
use crate::{Error, Param};

/// Default time between RPA changes.
pub const RPA_TIMEOUT_DEFAULT: Duration = Duration::from_secs(900);

/// Largest RPA timeout accepted from the host, in seconds.
pub const RPA_TIMEOUT_MAX_SECS: u16 = 0xA1B8;

/// Random address hash function `ah` from the Core specification.
///
/// The IRK and `prand` are in over-the-air (least significant byte first) order, and so is the
/// returned 24-bit hash.
pub fn ah(irk: &[u8; 16], prand: [u8; 3]) -> [u8; 3] {
    let mut key = *irk;
    key.reverse();
    let cipher = Aes128::new(GenericArray::from_slice(&key));

    let mut block = GenericArray::from([0u8; 16]);
    block[13] = prand[2];
    block[14] = prand[1];
    block[15] = prand[0];
    cipher.encrypt_block(&mut block);
    [block[15], block[14], block[13]]
}

/// Build a resolvable private address from `irk` and a random source.
pub fn generate_rpa<R: RngCore>(irk: &[u8; 16], rng: &mut R) -> BdAddr {
    let mut prand = [0u8; 3];
    rng.fill_bytes(&mut prand);
    prand[2] = (prand[2] & 0x3F) | 0x40;
    // The random part may be neither all zeros nor all ones.
    if prand[0] == 0 && prand[1] == 0 && prand[2] == 0x40 {
        prand[0] = 1;
    } else if prand[0] == 0xFF && prand[1] == 0xFF && prand[2] == 0x7F {
        prand[0] = 0xFE;
    }
    let hash = ah(irk, prand);
    BdAddr::new([hash[0], hash[1], hash[2], prand[0], prand[1], prand[2]])
}

/// Whether `addr` was generated from `irk`.
pub fn rpa_matches(irk: &[u8; 16], addr: &BdAddr) -> bool {
    let raw = addr.raw();
    is_rpa(addr) && ah(irk, [raw[3], raw[4], raw[5]]) == [raw[0], raw[1], raw[2]]
}

fn irk_nonzero(irk: &[u8; 16]) -> bool {
    irk.iter().any(|&b| b != 0)
}

/// A peer device known to the controller.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvingEntry {
    /// Identity address of the peer; public or random static.
    pub identity: Address,
    pub peer_irk: [u8; 16],
    pub local_irk: [u8; 16],
    local_rpa: Option<BdAddr>,
    peer_rpa: Option<BdAddr>,
}

/// Resolving list with room for `N` devices.
pub struct ResolvingList<const N: usize> {
    entries: Vec<ResolvingEntry, N>,
    enabled: bool,
    rpa_timeout: Duration,
}

impl<const N: usize> Default for ResolvingList<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ResolvingList<N> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            enabled: false,
            rpa_timeout: RPA_TIMEOUT_DEFAULT,
        }
    }

    /// Add a device.
    pub fn add(&mut self, identity: Address, peer_irk: [u8; 16], local_irk: [u8; 16]) -> Result<(), Error> {
        if identity.kind != AddrKind::PUBLIC && identity.kind != AddrKind::RANDOM {
            return Err(Error::InvalidParams(Param::PeerAddressType));
        }
        if self.find(&identity).is_some() {
            return Err(Error::InvalidParams(Param::Address));
        }
        self.entries
            .push(ResolvingEntry {
                identity,
                peer_irk,
                local_irk,
                local_rpa: None,
                peer_rpa: None,
            })
            .map_err(|_| Error::MemCapacity)
    }

    /// Remove a device.
    pub fn remove(&mut self, identity: &Address) -> Result<(), Error> {
        let idx = self.find(identity).ok_or(Error::UnknownConnection)?;
        self.entries.remove(idx);
        Ok(())
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

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Whether address resolution is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Set the RPA timeout in seconds.
    pub fn set_rpa_timeout(&mut self, secs: u16) -> Result<(), Error> {
        if secs == 0 || secs > RPA_TIMEOUT_MAX_SECS {
            return Err(Error::InvalidParams(Param::RpaTimeout));
        }
        self.rpa_timeout = Duration::from_secs(secs as u64);
        Ok(())
    }

    pub fn rpa_timeout(&self) -> Duration {
        self.rpa_timeout
    }

    /// Index of the entry for `identity`.
    pub fn find(&self, identity: &Address) -> Option<usize> {
        self.entries.iter().position(|e| e.identity == *identity)
    }

    /// Whether a local IRK is known for `identity`, so we can advertise to it with an RPA.
    pub fn has_local_irk(&self, identity: &Address) -> bool {
        self.find(identity).is_some_and(|idx| irk_nonzero(&self.entries[idx].local_irk))
    }

    pub fn entry(&self, idx: usize) -> Option<&ResolvingEntry> {
        self.entries.get(idx)
    }

    /// Peer IRKs in list order, for the radio address resolution engine.
    pub fn peer_irks(&self) -> Vec<[u8; 16], N> {
        self.entries.iter().map(|e| e.peer_irk).collect()
    }

    /// Find the device that generated `addr` and remember `addr` as its current RPA.
    pub fn resolve(&mut self, addr: &BdAddr) -> Option<usize> {
        if !is_rpa(addr) {
            return None;
        }
        let idx = self
            .entries
            .iter()
            .position(|e| irk_nonzero(&e.peer_irk) && rpa_matches(&e.peer_irk, addr))?;
        self.entries[idx].peer_rpa = Some(*addr);
        Some(idx)
    }

    /// Record `addr` as the current RPA of the device at `idx`, resolved elsewhere.
    pub fn set_peer_rpa(&mut self, idx: usize, addr: BdAddr) {
        if let Some(e) = self.entries.get_mut(idx) {
            e.peer_rpa = Some(addr);
        }
    }

    /// Generate a fresh RPA for the device `identity`.
    ///
    /// With `local` the local IRK is used and the result is our own address towards that peer,
    /// otherwise the peer IRK is used. Returns `None` if the device is unknown or the IRK is
    /// zero, in which case identity addresses are used.
    pub fn gen_rpa<R: RngCore>(&mut self, identity: &Address, local: bool, rng: &mut R) -> Option<BdAddr> {
        let idx = self.find(identity)?;
        let e = &mut self.entries[idx];
        let irk = if local { e.local_irk } else { e.peer_irk };
        if !irk_nonzero(&irk) {
            return None;
        }
        let rpa = generate_rpa(&irk, rng);
        if local {
            e.local_rpa = Some(rpa);
        } else {
            e.peer_rpa = Some(rpa);
        }
        Some(rpa)
    }

    /// Our current RPA towards `identity`.
    pub fn local_rpa(&self, identity: &Address) -> Option<BdAddr> {
        self.find(identity).and_then(|idx| self.entries[idx].local_rpa)
    }

    /// The current RPA of `identity`.
    pub fn peer_rpa(&self, identity: &Address) -> Option<BdAddr> {
        self.find(identity).and_then(|idx| self.entries[idx].peer_rpa)
    }
}

#[cfg(test)]
mod tests {
    use rand_chacha::{ChaCha12Core, ChaCha12Rng};
    use rand_core::SeedableRng;

    use super::*;

    fn irk_from_be(hex: u128) -> [u8; 16] {
        hex.to_le_bytes()
    }

    #[test]
    fn ah_sample_data() {
        let irk = irk_from_be(0xec0234a357c8ad05341010a60a397d9b);
        let hash = ah(&irk, [0x94, 0x81, 0x70]);
        assert_eq!(hash, [0xaa, 0xfb, 0x0d]);
    }

    #[test]
    fn generate_and_resolve() {
        let mut rng: ChaCha12Rng = ChaCha12Core::seed_from_u64(1).into();
        let peer = Address::public([1, 2, 3, 4, 5, 6]);
        let other = Address::random([9, 9, 9, 9, 9, 0xC9]);
        let mut list: ResolvingList<4> = ResolvingList::new();
        list.add(other, [7; 16], [0; 16]).unwrap();
        list.add(peer, [3; 16], [4; 16]).unwrap();

        let peer_rpa = list.gen_rpa(&peer, false, &mut rng).unwrap();
        assert!(is_rpa(&peer_rpa));
        assert_eq!(list.resolve(&peer_rpa), Some(1));
        assert_eq!(list.peer_rpa(&peer), Some(peer_rpa));

        let local = list.gen_rpa(&peer, true, &mut rng).unwrap();
        assert_eq!(list.local_rpa(&peer), Some(local));
        assert!(rpa_matches(&[4; 16], &local));
        assert_eq!(list.resolve(&local), None);

        // Zero local IRK: identity address is used.
        assert_eq!(list.gen_rpa(&other, true, &mut rng), None);
    }

    #[test]
    fn list_rules() {
        let mut list: ResolvingList<1> = ResolvingList::new();
        let peer = Address::public([1, 2, 3, 4, 5, 6]);
        list.add(peer, [1; 16], [0; 16]).unwrap();
        assert_eq!(list.add(peer, [1; 16], [0; 16]), Err(Error::InvalidParams(Param::Address)));
        assert_eq!(
            list.add(Address::random([1, 1, 1, 1, 1, 0xC1]), [1; 16], [0; 16]),
            Err(Error::MemCapacity)
        );
        assert_eq!(list.remove(&Address::random([0; 6])), Err(Error::UnknownConnection));
        list.remove(&peer).unwrap();
        assert!(list.is_empty());

        assert_eq!(list.set_rpa_timeout(0), Err(Error::InvalidParams(Param::RpaTimeout)));
        list.set_rpa_timeout(60).unwrap();
        assert_eq!(list.rpa_timeout(), Duration::from_secs(60));
    }
}
