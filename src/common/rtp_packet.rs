//! chunk of bytes that carries one RTP-MIDI datagram
//!
//! This is the stuff that goes on the wire on the data port once a session
//! is up.  Twelve bytes of RTP header, then the MIDI command section.  Very
//! intentionally simple: fixed buffer, getters and setters that keep
//! everything network endian and packed tight.
use byteorder::{ByteOrder, NetworkEndian};
use simple_error::bail;
use std::fmt;

use super::box_error::BoxError;

pub const RTP_BUF_SIZE: usize = 1500;
/// version 2, no padding, no extension, no csrc
const RTP_VERSION_BYTE: u8 = 0x80;
/// dynamic payload type used by every AppleMIDI implementation
const RTP_MIDI_PAYLOAD_TYPE: u8 = 0x61;

// The header layout for doc purposes
//   0: V=2|P|X|CC          -> always 0x80 here
//   1: M|PT                -> 0x61
// 2-3: sequence number
// 4-7: timestamp (100 usec units)
// 8-11: SSRC
pub const RTP_HEADER_SIZE: usize = 12;

/// the message that gets read/written on the data socket
pub struct RtpPacket {
    buffer: [u8; RTP_BUF_SIZE],
    nbytes: usize,
}

impl RtpPacket {
    /// build an empty packet with the header defaults filled in
    pub fn build() -> RtpPacket {
        let mut packet = RtpPacket {
            buffer: [0; RTP_BUF_SIZE],
            nbytes: RTP_HEADER_SIZE,
        };
        packet.buffer[0] = RTP_VERSION_BYTE;
        packet.buffer[1] = RTP_MIDI_PAYLOAD_TYPE;
        packet
    }
    pub fn get_sequence_num(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer[2..4])
    }
    pub fn set_sequence_num(&mut self, seq: u16) -> () {
        NetworkEndian::write_u16(&mut self.buffer[2..4], seq)
    }
    /// timestamp in 100 microsecond ticks since the session clock started
    pub fn get_timestamp(&self) -> u32 {
        NetworkEndian::read_u32(&self.buffer[4..8])
    }
    pub fn set_timestamp(&mut self, ts: u32) -> () {
        NetworkEndian::write_u32(&mut self.buffer[4..8], ts)
    }
    pub fn get_ssrc(&self) -> u32 {
        NetworkEndian::read_u32(&self.buffer[8..12])
    }
    pub fn set_ssrc(&mut self, ssrc: u32) -> () {
        NetworkEndian::write_u32(&mut self.buffer[8..12], ssrc)
    }
    /// Get the address of the buffer (used for reading from the network)
    pub fn get_buffer(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
    /// Get the slice that has data in it
    pub fn get_send_buffer(&self) -> &[u8] {
        &self.buffer[0..self.nbytes]
    }
    /// the MIDI command section after the header
    pub fn get_payload(&self) -> &[u8] {
        &self.buffer[RTP_HEADER_SIZE..self.nbytes]
    }
    /// copy a command section in behind the header
    pub fn set_payload(&mut self, payload: &[u8]) -> Result<(), BoxError> {
        if RTP_HEADER_SIZE + payload.len() > RTP_BUF_SIZE {
            bail!("midi payload of {} bytes does not fit", payload.len());
        }
        self.buffer[RTP_HEADER_SIZE..RTP_HEADER_SIZE + payload.len()].copy_from_slice(payload);
        self.nbytes = RTP_HEADER_SIZE + payload.len();
        Ok(())
    }
    /// set the number of bytes on the packet (after reading one off the wire)
    pub fn set_nbytes(&mut self, amt: usize) -> Result<(), BoxError> {
        if !self.is_valid(amt) {
            bail!("invalid rtp packet");
        }
        self.nbytes = amt;
        Ok(())
    }
    /// sanity checks before we trust the header accessors
    pub fn is_valid(&self, amt: usize) -> bool {
        amt >= RTP_HEADER_SIZE
            && self.buffer[0] & 0xC0 == RTP_VERSION_BYTE
            && self.buffer[1] & 0x7F == RTP_MIDI_PAYLOAD_TYPE
    }
}

impl fmt::Display for RtpPacket {
    // This trait requires `fmt` with this exact signature.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ seq: {}, ts: {}, ssrc: {:08X}, nbytes: {} }}",
            self.get_sequence_num(),
            self.get_timestamp(),
            self.get_ssrc(),
            self.nbytes
        )
    }
}

#[cfg(test)]
mod test_rtp_packet {
    use super::*;

    #[test]
    fn build() {
        // a fresh packet should carry the fixed header bytes
        let packet = RtpPacket::build();
        let buf = packet.get_send_buffer();
        assert_eq!(buf.len(), RTP_HEADER_SIZE);
        assert_eq!(buf[0], 0x80);
        assert_eq!(buf[1], 0x61);
    }
    #[test]
    fn sequence_num() {
        let mut packet = RtpPacket::build();
        packet.set_sequence_num(0xBEEF);
        assert_eq!(packet.get_sequence_num(), 0xBEEF);
    }
    #[test]
    fn timestamp() {
        let mut packet = RtpPacket::build();
        packet.set_timestamp(123456);
        assert_eq!(packet.get_timestamp(), 123456);
    }
    #[test]
    fn ssrc() {
        let mut packet = RtpPacket::build();
        packet.set_ssrc(0xCAFEBABE);
        assert_eq!(packet.get_ssrc(), 0xCAFEBABE);
    }
    #[test]
    fn payload() {
        // the payload should land right behind the header
        let mut packet = RtpPacket::build();
        packet.set_payload(&[0x23, 0x90, 0x3C, 0x40]).unwrap();
        assert_eq!(packet.get_payload(), &[0x23, 0x90, 0x3C, 0x40]);
        assert_eq!(packet.get_send_buffer().len(), RTP_HEADER_SIZE + 4);
    }
    #[test]
    fn is_valid() {
        // too short, then wrong version, then a good one
        let mut packet = RtpPacket::build();
        assert_eq!(packet.is_valid(4), false);
        assert!(packet.set_nbytes(RTP_HEADER_SIZE).is_ok());
        packet.get_buffer()[0] = 0x40;
        assert_eq!(packet.is_valid(RTP_HEADER_SIZE), false);
    }
}
