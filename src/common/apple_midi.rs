//! AppleMIDI session control messages.
//!
//! These share the UDP ports with RTP data and are told apart by the two
//! 0xFF bytes up front, followed by a two letter ASCII command.  Everything
//! here is fixed layout network endian, so the codec is plain offsets over
//! the datagram.
use byteorder::{ByteOrder, NetworkEndian};
use simple_error::bail;
use std::fmt;

use crate::common::box_error::BoxError;

pub const PROTOCOL_VERSION: u32 = 2;

/// a session control message, parsed or about to be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMessage {
    /// IN - ask to open a session
    Invitation(Invitation),
    /// OK - invitation accepted
    Accepted(Invitation),
    /// NO - invitation rejected
    Rejected(Invitation),
    /// CK - one leg of a clock sync exchange
    ClockSync(ClockSync),
    /// BY - goodbye, tear the session down
    Goodbye { initiator_token: u32, ssrc: u32 },
}

/// body shared by IN / OK / NO
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    pub initiator_token: u32,
    pub ssrc: u32,
    pub name: String,
}

/// body of a CK message.  count says which timestamps are filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSync {
    pub ssrc: u32,
    pub count: u8,
    pub t1: u64,
    pub t2: u64,
    pub t3: u64,
}

/// true when a datagram is session control rather than RTP
pub fn is_session_message(data: &[u8]) -> bool {
    data.len() >= 4 && data[0] == 0xFF && data[1] == 0xFF
}

impl SessionMessage {
    /// parse one control datagram.  The caller has already checked
    /// [`is_session_message`].
    pub fn parse(data: &[u8]) -> Result<SessionMessage, BoxError> {
        if data.len() < 4 {
            bail!("session message too short: {} bytes", data.len());
        }
        let cmd = [data[2], data[3]];
        match &cmd {
            b"IN" => Ok(SessionMessage::Invitation(Self::parse_invitation(data)?)),
            b"OK" => Ok(SessionMessage::Accepted(Self::parse_invitation(data)?)),
            b"NO" => Ok(SessionMessage::Rejected(Self::parse_invitation(data)?)),
            b"CK" => {
                if data.len() < 36 {
                    bail!("clock sync needs 36 bytes, got {}", data.len());
                }
                Ok(SessionMessage::ClockSync(ClockSync {
                    ssrc: NetworkEndian::read_u32(&data[4..8]),
                    count: data[8],
                    t1: NetworkEndian::read_u64(&data[12..20]),
                    t2: NetworkEndian::read_u64(&data[20..28]),
                    t3: NetworkEndian::read_u64(&data[28..36]),
                }))
            }
            b"BY" => {
                if data.len() < 16 {
                    bail!("goodbye needs 16 bytes, got {}", data.len());
                }
                let version = NetworkEndian::read_u32(&data[4..8]);
                if version != PROTOCOL_VERSION {
                    bail!("goodbye with protocol version {}", version);
                }
                Ok(SessionMessage::Goodbye {
                    initiator_token: NetworkEndian::read_u32(&data[8..12]),
                    ssrc: NetworkEndian::read_u32(&data[12..16]),
                })
            }
            _ => {
                bail!("unknown session command {:02X}{:02X}", cmd[0], cmd[1]);
            }
        }
    }

    fn parse_invitation(data: &[u8]) -> Result<Invitation, BoxError> {
        if data.len() < 16 {
            bail!("invitation needs 16 bytes, got {}", data.len());
        }
        let version = NetworkEndian::read_u32(&data[4..8]);
        if version != PROTOCOL_VERSION {
            bail!("invitation with protocol version {} (want 2)", version);
        }
        // name is optional on OK/NO, NUL terminated when present
        let raw_name = &data[16..];
        let name_end = raw_name.iter().position(|b| *b == 0).unwrap_or(raw_name.len());
        let name = match std::str::from_utf8(&raw_name[..name_end]) {
            Ok(s) => String::from(s),
            Err(_) => bail!("invitation name is not utf-8"),
        };
        Ok(Invitation {
            initiator_token: NetworkEndian::read_u32(&data[8..12]),
            ssrc: NetworkEndian::read_u32(&data[12..16]),
            name,
        })
    }

    /// serialize for the wire
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SessionMessage::Invitation(inv) => Self::invitation_bytes(b"IN", inv),
            SessionMessage::Accepted(inv) => Self::invitation_bytes(b"OK", inv),
            SessionMessage::Rejected(inv) => Self::invitation_bytes(b"NO", inv),
            SessionMessage::ClockSync(ck) => {
                let mut out = vec![0u8; 36];
                out[0] = 0xFF;
                out[1] = 0xFF;
                out[2] = b'C';
                out[3] = b'K';
                NetworkEndian::write_u32(&mut out[4..8], ck.ssrc);
                out[8] = ck.count;
                // bytes 9..12 stay zero padding
                NetworkEndian::write_u64(&mut out[12..20], ck.t1);
                NetworkEndian::write_u64(&mut out[20..28], ck.t2);
                NetworkEndian::write_u64(&mut out[28..36], ck.t3);
                out
            }
            SessionMessage::Goodbye {
                initiator_token,
                ssrc,
            } => {
                let mut out = vec![0u8; 16];
                out[0] = 0xFF;
                out[1] = 0xFF;
                out[2] = b'B';
                out[3] = b'Y';
                NetworkEndian::write_u32(&mut out[4..8], PROTOCOL_VERSION);
                NetworkEndian::write_u32(&mut out[8..12], *initiator_token);
                NetworkEndian::write_u32(&mut out[12..16], *ssrc);
                out
            }
        }
    }

    fn invitation_bytes(cmd: &[u8; 2], inv: &Invitation) -> Vec<u8> {
        let mut out = vec![0u8; 16];
        out[0] = 0xFF;
        out[1] = 0xFF;
        out[2] = cmd[0];
        out[3] = cmd[1];
        NetworkEndian::write_u32(&mut out[4..8], PROTOCOL_VERSION);
        NetworkEndian::write_u32(&mut out[8..12], inv.initiator_token);
        NetworkEndian::write_u32(&mut out[12..16], inv.ssrc);
        out.extend_from_slice(inv.name.as_bytes());
        out.push(0);
        out
    }
}

impl fmt::Display for SessionMessage {
    // This trait requires `fmt` with this exact signature.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionMessage::Invitation(i) => {
                write!(f, "{{ IN token: {:08X} ssrc: {:08X} name: {} }}", i.initiator_token, i.ssrc, i.name)
            }
            SessionMessage::Accepted(i) => {
                write!(f, "{{ OK token: {:08X} ssrc: {:08X} name: {} }}", i.initiator_token, i.ssrc, i.name)
            }
            SessionMessage::Rejected(i) => {
                write!(f, "{{ NO token: {:08X} ssrc: {:08X} }}", i.initiator_token, i.ssrc)
            }
            SessionMessage::ClockSync(ck) => {
                write!(
                    f,
                    "{{ CK ssrc: {:08X} count: {} t: {}/{}/{} }}",
                    ck.ssrc, ck.count, ck.t1, ck.t2, ck.t3
                )
            }
            SessionMessage::Goodbye { initiator_token, ssrc } => {
                write!(f, "{{ BY token: {:08X} ssrc: {:08X} }}", initiator_token, ssrc)
            }
        }
    }
}
