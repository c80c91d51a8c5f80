//! Advertising channel PDUs.
//!
//! Every PDU starts with a two byte header: the PDU type in bits 0..3, ChSel in bit 5, TxAdd in
//! bit 6 and RxAdd in bit 7, followed by the payload length.

use super::address::BdAddr;
use crate::codec::{check_len, Decode, Encode, Error, FixedSize, Type};
use crate::cursor::{ReadCursor, WriteCursor};

/// Largest advertising or scan response data.
pub const MAX_ADV_DATA_LEN: usize = 31;

/// Payload length of a directed advertising PDU.
pub const ADV_DIRECT_IND_LEN: u8 = 12;

/// Payload length of a scan request.
pub const SCAN_REQ_LEN: u8 = 12;

/// Payload length of a connect request.
pub const CONNECT_REQ_LEN: u8 = 34;

/// Advertising channel PDU types.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PduType {
    AdvInd = 0,
    AdvDirectInd = 1,
    AdvNonconnInd = 2,
    ScanReq = 3,
    ScanRsp = 4,
    ConnectReq = 5,
    AdvScanInd = 6,
}

impl TryFrom<u8> for PduType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::AdvInd,
            1 => Self::AdvDirectInd,
            2 => Self::AdvNonconnInd,
            3 => Self::ScanReq,
            4 => Self::ScanRsp,
            5 => Self::ConnectReq,
            6 => Self::AdvScanInd,
            _ => return Err(Error::InvalidValue),
        })
    }
}

const TYPE_MASK: u8 = 0x0F;
const CHSEL: u8 = 1 << 5;
const TXADD: u8 = 1 << 6;
const RXADD: u8 = 1 << 7;

/// PDU header.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduHeader {
    pub pdu_type: PduType,
    pub chsel: bool,
    /// The address in the first payload field is random.
    pub tx_add: bool,
    /// The address in the second payload field is random.
    pub rx_add: bool,
    /// Payload length.
    pub len: u8,
}

impl PduHeader {
    pub fn new(pdu_type: PduType, tx_add: bool, rx_add: bool, len: u8) -> Self {
        Self {
            pdu_type,
            chsel: false,
            tx_add,
            rx_add,
            len,
        }
    }

    /// The first header byte.
    pub fn flags(&self) -> u8 {
        let mut b = self.pdu_type as u8;
        if self.chsel {
            b |= CHSEL;
        }
        if self.tx_add {
            b |= TXADD;
        }
        if self.rx_add {
            b |= RXADD;
        }
        b
    }

    /// Parse the header from its two bytes.
    pub fn from_bytes(flags: u8, len: u8) -> Result<Self, Error> {
        Ok(Self {
            pdu_type: PduType::try_from(flags & TYPE_MASK)?,
            chsel: flags & CHSEL != 0,
            tx_add: flags & TXADD != 0,
            rx_add: flags & RXADD != 0,
            len,
        })
    }
}

impl FixedSize for PduHeader {
    const SIZE: usize = 2;
}

impl Encode for PduHeader {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        check_len(dest, 2)?;
        dest[0] = self.flags();
        dest[1] = self.len;
        Ok(())
    }
}

impl Decode<'_> for PduHeader {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        check_len(src, 2)?;
        Self::from_bytes(src[0], src[1])
    }
}

/// LL data of a connect request.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub access_address: u32,
    /// CRC initialization value, 24 bits.
    pub crc_init: u32,
    /// Transmit window size in 1.25 ms units.
    pub win_size: u8,
    /// Transmit window offset in 1.25 ms units.
    pub win_offset: u16,
    /// Connection interval in 1.25 ms units.
    pub interval: u16,
    pub latency: u16,
    /// Supervision timeout in 10 ms units.
    pub timeout: u16,
    /// Used data channels, one bit per channel 0..=36.
    pub channel_map: [u8; 5],
    /// Channel hop increment.
    pub hop: u8,
    /// Master sleep clock accuracy index.
    pub sca: u8,
}

impl ConnectRequest {
    /// Number of data channels marked used in the channel map.
    pub fn used_channels(&self) -> u32 {
        let mut map = self.channel_map;
        map[4] &= 0x1F;
        map.iter().map(|b| b.count_ones()).sum()
    }
}

impl FixedSize for ConnectRequest {
    const SIZE: usize = 22;
}

impl Encode for ConnectRequest {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        check_len(dest, Self::SIZE)?;
        let crc = self.crc_init.to_le_bytes();
        let mut w = WriteCursor::new(dest);
        w.write(self.access_address)?;
        w.append(&crc[..3])?;
        w.write(self.win_size)?;
        w.write(self.win_offset)?;
        w.write(self.interval)?;
        w.write(self.latency)?;
        w.write(self.timeout)?;
        w.append(&self.channel_map)?;
        w.write((self.hop & 0x1F) | (self.sca << 5))?;
        Ok(())
    }
}

impl Decode<'_> for ConnectRequest {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        check_len(src, Self::SIZE)?;
        let mut r = ReadCursor::new(src);
        let access_address = r.read()?;
        let crc = r.read_array::<3>()?;
        let win_size = r.read()?;
        let win_offset = r.read()?;
        let interval = r.read()?;
        let latency = r.read()?;
        let timeout = r.read()?;
        let channel_map = r.read_array::<5>()?;
        let hop_sca: u8 = r.read()?;
        Ok(Self {
            access_address,
            crc_init: u32::from_le_bytes([crc[0], crc[1], crc[2], 0]),
            win_size,
            win_offset,
            interval,
            latency,
            timeout,
            channel_map,
            hop: hop_sca & 0x1F,
            sca: hop_sca >> 5,
        })
    }
}

/// A decoded advertising channel PDU payload.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvPdu<'a> {
    AdvInd { adva: BdAddr, data: &'a [u8] },
    AdvDirectInd { adva: BdAddr, inita: BdAddr },
    AdvNonconnInd { adva: BdAddr, data: &'a [u8] },
    AdvScanInd { adva: BdAddr, data: &'a [u8] },
    ScanReq { scana: BdAddr, adva: BdAddr },
    ScanRsp { adva: BdAddr, data: &'a [u8] },
    ConnectReq { inita: BdAddr, adva: BdAddr, lldata: ConnectRequest },
}

impl<'a> AdvPdu<'a> {
    pub fn pdu_type(&self) -> PduType {
        match self {
            Self::AdvInd { .. } => PduType::AdvInd,
            Self::AdvDirectInd { .. } => PduType::AdvDirectInd,
            Self::AdvNonconnInd { .. } => PduType::AdvNonconnInd,
            Self::AdvScanInd { .. } => PduType::AdvScanInd,
            Self::ScanReq { .. } => PduType::ScanReq,
            Self::ScanRsp { .. } => PduType::ScanRsp,
            Self::ConnectReq { .. } => PduType::ConnectReq,
        }
    }

    /// The advertiser address carried by every advertising channel PDU.
    pub fn adva(&self) -> &BdAddr {
        match self {
            Self::AdvInd { adva, .. }
            | Self::AdvDirectInd { adva, .. }
            | Self::AdvNonconnInd { adva, .. }
            | Self::AdvScanInd { adva, .. }
            | Self::ScanReq { adva, .. }
            | Self::ScanRsp { adva, .. }
            | Self::ConnectReq { adva, .. } => adva,
        }
    }

    /// Build the header for this payload with the given address bits.
    pub fn header(&self, tx_add: bool, rx_add: bool) -> PduHeader {
        PduHeader::new(self.pdu_type(), tx_add, rx_add, self.size() as u8)
    }

    /// Decode a payload described by `header`.
    pub fn decode(header: &PduHeader, payload: &'a [u8]) -> Result<Self, Error> {
        let len = header.len as usize;
        check_len(payload, len)?;
        let payload = &payload[..len];
        let fixed = |expected: u8| {
            if header.len == expected {
                Ok(())
            } else {
                Err(Error::InvalidValue)
            }
        };
        if len < 6 || len > 6 + MAX_ADV_DATA_LEN {
            return Err(Error::InvalidValue);
        }
        let mut r = ReadCursor::new(payload);
        let first: BdAddr = r.read()?;
        Ok(match header.pdu_type {
            PduType::AdvInd => Self::AdvInd {
                adva: first,
                data: r.remaining(),
            },
            PduType::AdvNonconnInd => Self::AdvNonconnInd {
                adva: first,
                data: r.remaining(),
            },
            PduType::AdvScanInd => Self::AdvScanInd {
                adva: first,
                data: r.remaining(),
            },
            PduType::ScanRsp => Self::ScanRsp {
                adva: first,
                data: r.remaining(),
            },
            PduType::AdvDirectInd => {
                fixed(ADV_DIRECT_IND_LEN)?;
                Self::AdvDirectInd {
                    adva: first,
                    inita: r.read()?,
                }
            }
            PduType::ScanReq => {
                fixed(SCAN_REQ_LEN)?;
                Self::ScanReq {
                    scana: first,
                    adva: r.read()?,
                }
            }
            PduType::ConnectReq => {
                fixed(CONNECT_REQ_LEN)?;
                Self::ConnectReq {
                    inita: first,
                    adva: r.read()?,
                    lldata: r.read()?,
                }
            }
        })
    }

    /// Decode a complete PDU, header included.
    pub fn parse(pdu: &'a [u8]) -> Result<(PduHeader, Self), Error> {
        let header = PduHeader::decode(pdu)?;
        let body = Self::decode(&header, &pdu[PduHeader::SIZE..])?;
        Ok((header, body))
    }
}

impl Type for AdvPdu<'_> {
    fn size(&self) -> usize {
        match self {
            Self::AdvInd { data, .. }
            | Self::AdvNonconnInd { data, .. }
            | Self::AdvScanInd { data, .. }
            | Self::ScanRsp { data, .. } => 6 + data.len(),
            Self::AdvDirectInd { .. } => ADV_DIRECT_IND_LEN as usize,
            Self::ScanReq { .. } => SCAN_REQ_LEN as usize,
            Self::ConnectReq { .. } => CONNECT_REQ_LEN as usize,
        }
    }
}

impl Encode for AdvPdu<'_> {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        let mut w = WriteCursor::new(dest);
        match self {
            Self::AdvInd { adva, data }
            | Self::AdvNonconnInd { adva, data }
            | Self::AdvScanInd { adva, data }
            | Self::ScanRsp { adva, data } => {
                if data.len() > MAX_ADV_DATA_LEN {
                    return Err(Error::InvalidValue);
                }
                w.write(*adva)?;
                w.append(data)?;
            }
            Self::AdvDirectInd { adva, inita } => {
                w.write(*adva)?;
                w.write(*inita)?;
            }
            Self::ScanReq { scana, adva } => {
                w.write(*scana)?;
                w.write(*adva)?;
            }
            Self::ConnectReq { inita, adva, lldata } => {
                w.write(*inita)?;
                w.write(*adva)?;
                w.write(*lldata)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADVA: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
    const INITA: [u8; 6] = [0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xC6];

    fn lldata() -> ConnectRequest {
        ConnectRequest {
            access_address: 0x5065_A1B2,
            crc_init: 0x00AB_CDEF,
            win_size: 2,
            win_offset: 3,
            interval: 24,
            latency: 0,
            timeout: 72,
            channel_map: [0xFF, 0xFF, 0xFF, 0xFF, 0x1F],
            hop: 7,
            sca: 5,
        }
    }

    #[test]
    fn header_bits() {
        let h = PduHeader::new(PduType::ScanRsp, true, false, 9);
        assert_eq!(h.flags(), 0x44);
        let h = PduHeader::from_bytes(0xA5, 34).unwrap();
        assert_eq!(h.pdu_type, PduType::ConnectReq);
        assert!(h.chsel);
        assert!(!h.tx_add);
        assert!(h.rx_add);
        assert_eq!(PduHeader::from_bytes(0x07, 0), Err(Error::InvalidValue));
    }

    #[test]
    fn adv_ind_layout() {
        let pdu = AdvPdu::AdvInd {
            adva: BdAddr::new(ADVA),
            data: &[2, 1, 6],
        };
        let mut buf = [0u8; 40];
        let header = pdu.header(false, false);
        header.encode(&mut buf).unwrap();
        pdu.encode(&mut buf[2..]).unwrap();
        assert_eq!(&buf[..11], &[0x00, 9, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 2, 1, 6]);

        let (h, decoded) = AdvPdu::parse(&buf[..11]).unwrap();
        assert_eq!(h, header);
        assert_eq!(decoded, pdu);
    }

    #[test]
    fn connect_req_layout() {
        let pdu = AdvPdu::ConnectReq {
            inita: BdAddr::new(INITA),
            adva: BdAddr::new(ADVA),
            lldata: lldata(),
        };
        let mut buf = [0u8; 36];
        pdu.header(true, false).encode(&mut buf).unwrap();
        pdu.encode(&mut buf[2..]).unwrap();
        assert_eq!(buf[0], 0x45);
        assert_eq!(buf[1], 34);
        // Access address, then the 24-bit CRC init.
        assert_eq!(&buf[14..21], &[0xB2, 0xA1, 0x65, 0x50, 0xEF, 0xCD, 0xAB]);
        // Hop in the low five bits, SCA in the top three.
        assert_eq!(buf[35], 7 | (5 << 5));

        let (_, decoded) = AdvPdu::parse(&buf).unwrap();
        assert_eq!(decoded, pdu);
        if let AdvPdu::ConnectReq { lldata, .. } = decoded {
            assert_eq!(lldata.used_channels(), 37);
        }
    }

    #[test]
    fn length_validation() {
        // Scan request with a data byte too many.
        let mut buf = [0u8; 15];
        buf[0] = PduType::ScanReq as u8;
        buf[1] = 13;
        assert_eq!(AdvPdu::parse(&buf), Err(Error::InvalidValue));

        // Header length beyond the buffer.
        buf[1] = 12;
        assert_eq!(AdvPdu::parse(&buf[..10]), Err(Error::InsufficientSpace));

        // Advertising PDU shorter than an address.
        let short = [0x00, 5, 1, 2, 3, 4, 5];
        assert_eq!(AdvPdu::parse(&short), Err(Error::InvalidValue));

        let big = [0u8; 32];
        let pdu = AdvPdu::ScanRsp {
            adva: BdAddr::new(ADVA),
            data: &big,
        };
        let mut out = [0u8; 64];
        assert_eq!(pdu.encode(&mut out), Err(Error::InvalidValue));
    }
}
