//! Device addresses.

pub use bt_hci::param::{AddrKind, BdAddr};

/// A device address and its type.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub kind: AddrKind,
    pub addr: BdAddr,
}

impl Address {
    pub fn public(addr: [u8; 6]) -> Self {
        Self {
            kind: AddrKind::PUBLIC,
            addr: BdAddr::new(addr),
        }
    }

    pub fn random(addr: [u8; 6]) -> Self {
        Self {
            kind: AddrKind::RANDOM,
            addr: BdAddr::new(addr),
        }
    }

    /// Address from a PDU address field with its TxAdd/RxAdd bit.
    pub fn from_pdu(addr: BdAddr, random: bool) -> Self {
        Self {
            kind: if random { AddrKind::RANDOM } else { AddrKind::PUBLIC },
            addr,
        }
    }

    /// Whether the address goes over the air with the random address bit set.
    pub fn is_random(&self) -> bool {
        is_random_kind(self.kind)
    }

    /// Whether this is a resolvable private address.
    pub fn is_rpa(&self) -> bool {
        self.kind == AddrKind::RANDOM && is_rpa(&self.addr)
    }
}

/// Whether `kind` denotes a random device address, identity or otherwise.
pub fn is_random_kind(kind: AddrKind) -> bool {
    kind == AddrKind::RANDOM || kind == AddrKind::RESOLVABLE_PRIVATE_OR_RANDOM
}

/// Own address type from its HCI encoding.
pub fn own_addr_kind(raw: u8) -> Option<AddrKind> {
    match raw {
        0 => Some(AddrKind::PUBLIC),
        1 => Some(AddrKind::RANDOM),
        2 => Some(AddrKind::RESOLVABLE_PRIVATE_OR_PUBLIC),
        3 => Some(AddrKind::RESOLVABLE_PRIVATE_OR_RANDOM),
        _ => None,
    }
}

/// Peer address type from its HCI encoding.
pub fn peer_addr_kind(raw: u8) -> Option<AddrKind> {
    match raw {
        0 => Some(AddrKind::PUBLIC),
        1 => Some(AddrKind::RANDOM),
        _ => None,
    }
}

/// Whether `kind` asks for a resolvable private address.
pub fn uses_rpa(kind: AddrKind) -> bool {
    kind == AddrKind::RESOLVABLE_PRIVATE_OR_PUBLIC || kind == AddrKind::RESOLVABLE_PRIVATE_OR_RANDOM
}

/// Whether a random address is resolvable private (the two most significant bits are `01`).
pub fn is_rpa(addr: &BdAddr) -> bool {
    addr.raw()[5] & 0xC0 == 0x40
}

/// Check a random device address.
///
/// Static and non-resolvable addresses must not have all random bits zero or all one; a
/// resolvable address must have a valid random part. The `10` subtype is reserved.
pub fn is_valid_random_address(addr: &BdAddr) -> bool {
    let raw = addr.raw();
    let (random, top) = match raw[5] & 0xC0 {
        // Static and non-resolvable: 46 random bits.
        0xC0 | 0x00 => (&raw[..5], raw[5] & 0x3F),
        // Resolvable: 22 random bits in the prand.
        0x40 => (&raw[3..5], raw[5] & 0x3F),
        _ => return false,
    };
    let all_zero = top == 0 && random.iter().all(|&b| b == 0);
    let all_one = top == 0x3F && random.iter().all(|&b| b == 0xFF);
    !(all_zero || all_one)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_address_validity() {
        assert!(is_valid_random_address(&BdAddr::new([1, 2, 3, 4, 5, 0xC6])));
        assert!(!is_valid_random_address(&BdAddr::new([0, 0, 0, 0, 0, 0xC0])));
        assert!(!is_valid_random_address(&BdAddr::new([0xFF; 6])));
        assert!(!is_valid_random_address(&BdAddr::new([1, 2, 3, 4, 5, 0x86])));
        assert!(is_valid_random_address(&BdAddr::new([1, 2, 3, 4, 5, 0x06])));
        assert!(is_valid_random_address(&BdAddr::new([0, 0, 0, 1, 0, 0x40])));
        assert!(!is_valid_random_address(&BdAddr::new([9, 9, 9, 0, 0, 0x40])));
    }

    #[test]
    fn rpa_detection() {
        let rpa = Address::random([1, 2, 3, 4, 5, 0x4A]);
        assert!(rpa.is_rpa());
        assert!(!Address::public([1, 2, 3, 4, 5, 0x4A]).is_rpa());
        assert!(!Address::random([1, 2, 3, 4, 5, 0xCA]).is_rpa());
    }

    #[test]
    fn hci_address_types() {
        assert_eq!(own_addr_kind(3), Some(AddrKind::RESOLVABLE_PRIVATE_OR_RANDOM));
        assert_eq!(own_addr_kind(4), None);
        assert_eq!(peer_addr_kind(1), Some(AddrKind::RANDOM));
        assert_eq!(peer_addr_kind(2), None);
        assert!(uses_rpa(AddrKind::RESOLVABLE_PRIVATE_OR_PUBLIC));
        assert!(is_random_kind(AddrKind::RESOLVABLE_PRIVATE_OR_RANDOM));
        assert!(!is_random_kind(AddrKind::RESOLVABLE_PRIVATE_OR_PUBLIC));
    }
}
