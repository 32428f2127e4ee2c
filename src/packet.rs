//! Packet codec for the UNet wire format
//!
//! A packet is a fixed-capacity snapshot of sensor values: a header, up to
//! [`MAX_ANALOG`] analog `(id, value)` pairs, up to [`MAX_DIGITAL`] digital ids
//! and a bitmap with one bit per digital id.
//!
//! # Wire layout
//! All multi-byte fields are written in the sender's host order, announced by
//! the byte order flag at offset 4:
//!
//! | offset | field          | type |
//! |--------|----------------|------|
//! | 0      | magic          | u32  |
//! | 4      | byte order     | u8   |
//! | 5      | sequence       | u32  |
//! | 9      | node id        | i64  |
//! | 17     | proc id        | i64  |
//! | 25     | analog crc     | u16  |
//! | 27     | digital crc    | u16  |
//! | 29     | analog count   | u16  |
//! | 31     | digital count  | u16  |
//! | 33     | analog entries | `count * (i64, i64)` |
//! |        | digital ids    | `count * i64` |
//! |        | digital bits   | `ceil(count / 8)` bytes |
//!
//! Checksums are CRC-16/ARC over a little-endian rendering of each payload
//! section, so they do not depend on the header or on the wire byte order.
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_ARC};

use crate::errors::DecodeError;

/// Wire format identifier
pub const MAGIC: u32 = 0x1337_A1D1;

/// Maximum analog entries per packet
pub const MAX_ANALOG: usize = 100;

/// Maximum digital entries per packet
pub const MAX_DIGITAL: usize = 256;

/// Size of the digital bitmap in bytes
pub const MAX_DIGITAL_BYTES: usize = MAX_DIGITAL.div_ceil(8);

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 33;

const ANALOG_ENTRY_SIZE: usize = 16;
const DIGITAL_ID_SIZE: usize = 8;

/// Largest datagram a packet can encode to
pub const MAX_PACKET_SIZE: usize =
    HEADER_SIZE + MAX_ANALOG * ANALOG_ENTRY_SIZE + MAX_DIGITAL * DIGITAL_ID_SIZE + MAX_DIGITAL_BYTES;

/// Last sequence number before the counter wraps back to 1
pub const MAX_SEQUENCE: u32 = u32::MAX;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// Byte order announced in the packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ByteOrder {
    Little = 0,
    Big = 1,
}

impl ByteOrder {
    /// Byte order of the running host
    pub const fn host() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }

    fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(Self::Little),
            1 => Some(Self::Big),
            _ => None,
        }
    }
}

/// One analog sensor value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AnalogEntry {
    pub id: i64,
    pub val: i64,
}

impl AnalogEntry {
    pub fn new(id: i64, val: i64) -> Self {
        Self { id, val }
    }
}

/// A decoded or to-be-encoded UNet packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Per-sender sequence number, 0 is reserved for "not stamped"
    pub sequence: u32,

    /// Node that produced the packet
    pub node_id: i64,

    /// Process on that node that produced the packet
    pub proc_id: i64,

    analog_crc: u16,
    digital_crc: u16,
    analog: Vec<AnalogEntry>,
    digital_ids: Vec<i64>,
    digital_bits: [u8; MAX_DIGITAL_BYTES],
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            sequence: 0,
            node_id: 0,
            proc_id: 0,
            analog_crc: 0,
            digital_crc: 0,
            analog: Vec::new(),
            digital_ids: Vec::new(),
            digital_bits: [0; MAX_DIGITAL_BYTES],
        }
    }
}

impl Packet {
    /// Create an empty packet stamped with its origin
    pub fn new(node_id: i64, proc_id: i64) -> Self {
        Self {
            node_id,
            proc_id,
            ..Self::default()
        }
    }

    /// Append an analog entry
    ///
    /// Returns the entry index, or `None` when the analog array is full.
    pub fn add_analog(&mut self, id: i64, val: i64) -> Option<usize> {
        if self.analog.len() >= MAX_ANALOG {
            return None;
        }

        self.analog.push(AnalogEntry::new(id, val));
        Some(self.analog.len() - 1)
    }

    /// Append a digital entry
    ///
    /// Returns the entry index, or `None` when the digital array is full.
    pub fn add_digital(&mut self, id: i64, val: bool) -> Option<usize> {
        if self.digital_ids.len() >= MAX_DIGITAL {
            return None;
        }

        let idx = self.digital_ids.len();
        self.digital_ids.push(id);
        self.set_digital_bit(idx, val);
        Some(idx)
    }

    /// Overwrite the value of an existing analog entry
    pub fn set_analog(&mut self, idx: usize, val: i64) -> bool {
        match self.analog.get_mut(idx) {
            Some(entry) => {
                entry.val = val;
                true
            }
            None => false,
        }
    }

    /// Set bit `idx` of the digital bitmap, `false` when out of range
    pub fn set_digital_bit(&mut self, idx: usize, val: bool) -> bool {
        if idx >= MAX_DIGITAL {
            return false;
        }

        let (nbyte, nbit) = (idx / 8, idx % 8);
        if val {
            self.digital_bits[nbyte] |= 1 << nbit;
        } else {
            self.digital_bits[nbyte] &= !(1 << nbit);
        }
        true
    }

    /// Read bit `idx` of the digital bitmap, `None` when out of range
    pub fn get_digital_bit(&self, idx: usize) -> Option<bool> {
        if idx >= MAX_DIGITAL {
            return None;
        }

        Some(self.digital_bits[idx / 8] & (1 << (idx % 8)) != 0)
    }

    /// Sensor id of digital entry `idx`
    pub fn digital_id(&self, idx: usize) -> Option<i64> {
        self.digital_ids.get(idx).copied()
    }

    pub fn analog(&self) -> &[AnalogEntry] {
        &self.analog
    }

    pub fn digital_ids(&self) -> &[i64] {
        &self.digital_ids
    }

    pub fn analog_count(&self) -> usize {
        self.analog.len()
    }

    pub fn digital_count(&self) -> usize {
        self.digital_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.analog.is_empty() && self.digital_ids.is_empty()
    }

    /// Iterate digital entries as `(id, value)`
    pub fn digital_values(&self) -> impl Iterator<Item = (i64, bool)> + '_ {
        self.digital_ids
            .iter()
            .enumerate()
            .map(|(idx, id)| (*id, self.get_digital_bit(idx).unwrap_or(false)))
    }

    /// Identifier for log output: first analog id, first digital id, or the sequence number
    pub fn primary_id(&self) -> i64 {
        if let Some(entry) = self.analog.first() {
            return entry.id;
        }
        if let Some(id) = self.digital_ids.first() {
            return *id;
        }
        i64::from(self.sequence)
    }

    /// Checksum carried in the header (as received, or as of the last encode)
    pub fn analog_crc(&self) -> u16 {
        self.analog_crc
    }

    pub fn digital_crc(&self) -> u16 {
        self.digital_crc
    }

    /// CRC-16/ARC over the analog section
    pub fn compute_analog_crc(&self) -> u16 {
        let mut digest = CRC16.digest();
        for entry in &self.analog {
            digest.update(&entry.id.to_le_bytes());
            digest.update(&entry.val.to_le_bytes());
        }
        digest.finalize()
    }

    /// CRC-16/ARC over the digital ids followed by the used bitmap bytes
    pub fn compute_digital_crc(&self) -> u16 {
        let mut digest = CRC16.digest();
        for id in &self.digital_ids {
            digest.update(&id.to_le_bytes());
        }
        digest.update(&self.digital_bits[..self.bitmap_len()]);
        digest.finalize()
    }

    /// Refresh both header checksums from the current payload
    pub fn update_crcs(&mut self) {
        self.analog_crc = self.compute_analog_crc();
        self.digital_crc = self.compute_digital_crc();
    }

    /// Number of bytes this packet occupies on the wire
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE
            + self.analog.len() * ANALOG_ENTRY_SIZE
            + self.digital_ids.len() * DIGITAL_ID_SIZE
            + self.bitmap_len()
    }

    fn bitmap_len(&self) -> usize {
        self.digital_ids.len().div_ceil(8)
    }

    /// Serialize in host byte order, refreshing the checksums first
    pub fn encode(&mut self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Serialize into an existing buffer (appends)
    pub fn encode_into(&mut self, buf: &mut BytesMut) {
        self.update_crcs();
        let order = ByteOrder::host();
        let mut w = Writer { buf, order };

        w.u32(MAGIC);
        w.buf.put_u8(order as u8);
        w.u32(self.sequence);
        w.i64(self.node_id);
        w.i64(self.proc_id);
        w.u16(self.analog_crc);
        w.u16(self.digital_crc);
        // counts are bounded by MAX_ANALOG / MAX_DIGITAL, both below u16::MAX
        w.u16(self.analog.len() as u16);
        w.u16(self.digital_ids.len() as u16);

        for entry in &self.analog {
            w.i64(entry.id);
            w.i64(entry.val);
        }
        for id in &self.digital_ids {
            w.i64(*id);
        }
        let nbytes = self.bitmap_len();
        w.buf.put_slice(&self.digital_bits[..nbytes]);
    }

    /// Parse a datagram, converting every field to host order
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated {
                expected: HEADER_SIZE,
                received: bytes.len(),
            });
        }

        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if u32::from_le_bytes(raw) != MAGIC && u32::from_be_bytes(raw) != MAGIC {
            return Err(DecodeError::BadMagic(u32::from_le_bytes(raw)));
        }
        let order = ByteOrder::from_flag(bytes[4]).ok_or(DecodeError::BadByteOrder(bytes[4]))?;
        let mut r = Reader { buf: bytes, order };

        if r.u32() != MAGIC {
            return Err(DecodeError::BadMagic(u32::from_le_bytes(raw)));
        }
        r.buf.advance(1);

        let mut packet = Packet {
            sequence: r.u32(),
            node_id: r.i64(),
            proc_id: r.i64(),
            analog_crc: r.u16(),
            digital_crc: r.u16(),
            ..Packet::default()
        };

        let acount = usize::from(r.u16());
        let dcount = usize::from(r.u16());
        if acount > MAX_ANALOG {
            return Err(DecodeError::CountOverflow {
                kind: "analog",
                count: acount,
                max: MAX_ANALOG,
            });
        }
        if dcount > MAX_DIGITAL {
            return Err(DecodeError::CountOverflow {
                kind: "digital",
                count: dcount,
                max: MAX_DIGITAL,
            });
        }

        let nbytes = dcount.div_ceil(8);
        let expected = HEADER_SIZE + acount * ANALOG_ENTRY_SIZE + dcount * DIGITAL_ID_SIZE + nbytes;
        if bytes.len() < expected {
            return Err(DecodeError::Truncated {
                expected,
                received: bytes.len(),
            });
        }

        packet.analog.reserve_exact(acount);
        for _ in 0..acount {
            let id = r.i64();
            let val = r.i64();
            packet.analog.push(AnalogEntry { id, val });
        }
        packet.digital_ids.reserve_exact(dcount);
        for _ in 0..dcount {
            packet.digital_ids.push(r.i64());
        }
        r.buf.copy_to_slice(&mut packet.digital_bits[..nbytes]);

        Ok(packet)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nodeID={} procID={} dcount={} acount={} pnum={}",
            self.node_id,
            self.proc_id,
            self.digital_ids.len(),
            self.analog.len(),
            self.sequence
        )
    }
}

struct Writer<'a> {
    buf: &'a mut BytesMut,
    order: ByteOrder,
}

impl Writer<'_> {
    fn u16(&mut self, v: u16) {
        match self.order {
            ByteOrder::Little => self.buf.put_u16_le(v),
            ByteOrder::Big => self.buf.put_u16(v),
        }
    }

    fn u32(&mut self, v: u32) {
        match self.order {
            ByteOrder::Little => self.buf.put_u32_le(v),
            ByteOrder::Big => self.buf.put_u32(v),
        }
    }

    fn i64(&mut self, v: i64) {
        match self.order {
            ByteOrder::Little => self.buf.put_i64_le(v),
            ByteOrder::Big => self.buf.put_i64(v),
        }
    }
}

// Callers check the total length before reading, so the Buf getters never run short.
struct Reader<'a> {
    buf: &'a [u8],
    order: ByteOrder,
}

impl Reader<'_> {
    fn u16(&mut self) -> u16 {
        match self.order {
            ByteOrder::Little => self.buf.get_u16_le(),
            ByteOrder::Big => self.buf.get_u16(),
        }
    }

    fn u32(&mut self) -> u32 {
        match self.order {
            ByteOrder::Little => self.buf.get_u32_le(),
            ByteOrder::Big => self.buf.get_u32(),
        }
    }

    fn i64(&mut self) -> i64 {
        match self.order {
            ByteOrder::Little => self.buf.get_i64_le(),
            ByteOrder::Big => self.buf.get_i64(),
        }
    }
}

/// Next sequence number after `seq`, skipping the reserved 0
pub fn next_sequence(seq: u32) -> u32 {
    if seq >= MAX_SEQUENCE {
        1
    } else {
        seq + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Packet {
        let mut p = Packet::new(3001, 42);
        p.sequence = 7;
        p.add_analog(2, 100).unwrap();
        p.add_analog(3, -5).unwrap();
        p.add_digital(10, true).unwrap();
        p.add_digital(11, false).unwrap();
        p.add_digital(12, true).unwrap();
        p
    }

    /// Re-encode a packet with the opposite byte order to simulate a foreign host
    fn swap_order(bytes: &[u8]) -> Vec<u8> {
        let mut out = bytes.to_vec();
        let foreign = match ByteOrder::host() {
            ByteOrder::Little => ByteOrder::Big,
            ByteOrder::Big => ByteOrder::Little,
        };
        out[0..4].reverse();
        out[4] = foreign as u8;
        out[5..9].reverse();
        out[9..17].reverse();
        out[17..25].reverse();
        for range in [25..27, 27..29, 29..31, 31..33] {
            out[range].reverse();
        }
        let acount = u16::from_ne_bytes([bytes[29], bytes[30]]) as usize;
        let dcount = u16::from_ne_bytes([bytes[31], bytes[32]]) as usize;
        let mut off = HEADER_SIZE;
        for _ in 0..(acount * 2 + dcount) {
            out[off..off + 8].reverse();
            off += 8;
        }
        out
    }

    #[test]
    fn test_round_trip() {
        let mut p = sample();
        let bytes = p.encode();
        assert_eq!(bytes.len(), p.encoded_len());

        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded, p);
        assert_eq!(decoded.get_digital_bit(0), Some(true));
        assert_eq!(decoded.get_digital_bit(1), Some(false));
        assert_eq!(decoded.digital_id(2), Some(12));
    }

    #[test]
    fn test_foreign_byte_order() {
        let mut p = sample();
        let bytes = p.encode();
        let foreign = swap_order(&bytes);
        assert_ne!(&foreign[..], &bytes[..]);

        let decoded = Packet::decode(&foreign).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = sample().encode().to_vec();
        bytes[0] ^= 0xff;
        assert!(matches!(Packet::decode(&bytes), Err(DecodeError::BadMagic(_))));
    }

    #[test]
    fn test_bad_magic_wins_over_byte_order() {
        let mut bytes = sample().encode().to_vec();
        bytes[0] ^= 0xff;
        bytes[4] = 7;
        assert!(matches!(Packet::decode(&bytes), Err(DecodeError::BadMagic(_))));

        // a valid magic with an unknown flag is a byte order problem
        let mut bytes = sample().encode().to_vec();
        bytes[4] = 7;
        assert!(matches!(Packet::decode(&bytes), Err(DecodeError::BadByteOrder(7))));
    }

    #[test]
    fn test_truncated_rejected() {
        let bytes = sample().encode();
        assert!(matches!(
            Packet::decode(&bytes[..10]),
            Err(DecodeError::Truncated { .. })
        ));
        assert!(matches!(
            Packet::decode(&bytes[..bytes.len() - 1]),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_capacity_sentinel() {
        let mut p = Packet::default();
        for i in 0..MAX_ANALOG {
            assert_eq!(p.add_analog(i as i64, 0), Some(i));
        }
        assert_eq!(p.add_analog(9999, 1), None);
        assert_eq!(p.analog_count(), MAX_ANALOG);

        for i in 0..MAX_DIGITAL {
            assert!(p.add_digital(i as i64, i % 2 == 0).is_some());
        }
        assert_eq!(p.add_digital(9999, true), None);

        let bytes = p.encode();
        assert_eq!(bytes.len(), MAX_PACKET_SIZE);
    }

    #[test]
    fn test_bit_range() {
        let mut p = Packet::default();
        assert!(!p.set_digital_bit(MAX_DIGITAL, true));
        assert_eq!(p.get_digital_bit(MAX_DIGITAL), None);
        assert_eq!(p.digital_id(0), None);
        assert!(!p.set_analog(0, 5));
    }

    #[test]
    fn test_each_bit_independent() {
        for idx in 0..MAX_DIGITAL {
            let mut p = Packet::default();
            assert!(p.set_digital_bit(idx, true));
            for other in 0..MAX_DIGITAL {
                assert_eq!(p.get_digital_bit(other), Some(other == idx), "set {idx}, read {other}");
            }

            let mut full = Packet::default();
            for other in 0..MAX_DIGITAL {
                full.set_digital_bit(other, true);
            }
            assert!(full.set_digital_bit(idx, false));
            for other in 0..MAX_DIGITAL {
                assert_eq!(full.get_digital_bit(other), Some(other != idx), "cleared {idx}, read {other}");
            }
        }
    }

    #[test]
    fn test_crc_independent_of_header() {
        let mut a = sample();
        let mut b = sample();
        b.sequence = 999;
        b.node_id = 1;
        a.encode();
        b.encode();
        assert_eq!(a.analog_crc(), b.analog_crc());
        assert_eq!(a.digital_crc(), b.digital_crc());
    }

    #[test]
    fn test_crc_sections_change_independently() {
        let mut base = sample();
        base.update_crcs();

        let mut analog_changed = sample();
        analog_changed.set_analog(1, 6);
        analog_changed.update_crcs();
        assert_ne!(base.analog_crc(), analog_changed.analog_crc());
        assert_eq!(base.digital_crc(), analog_changed.digital_crc());

        let mut digital_changed = sample();
        digital_changed.set_digital_bit(1, true);
        digital_changed.update_crcs();
        assert_eq!(base.analog_crc(), digital_changed.analog_crc());
        assert_ne!(base.digital_crc(), digital_changed.digital_crc());
    }

    #[test]
    fn test_primary_id() {
        let mut p = Packet::default();
        p.sequence = 55;
        assert_eq!(p.primary_id(), 55);
        p.add_digital(8, true);
        assert_eq!(p.primary_id(), 8);
        p.add_analog(4, 0);
        assert_eq!(p.primary_id(), 4);
    }

    #[test]
    fn test_sequence_wrap() {
        assert_eq!(next_sequence(1), 2);
        assert_eq!(next_sequence(MAX_SEQUENCE - 1), MAX_SEQUENCE);
        assert_eq!(next_sequence(MAX_SEQUENCE), 1);
    }
}
