//! codec for the MIDI command section of an RTP-MIDI payload.
//!
//! The section starts with one header byte:
//!
//! ```text
//!   B J Z P | len (low nibble, or low 12 bits of two bytes when B is set)
//! ```
//!
//! followed by (delta_time, command) pairs.  Delta times are 1-4 byte
//! variable length quantities, 7 bits per byte with the top bit meaning
//! "more".  When Z is set the first command has no delta time in front of
//! it.  Commands use running status: a data byte where a status byte was
//! expected reuses the previous status.
//!
//! Encoding is intentionally plainer than decoding allows: no journal, Z=1,
//! all delta times zero, and every command carries its status byte.
use std::error::Error;
use std::fmt;

use crate::common::midi_event::MidiEvent;

const HEADER_B: u8 = 0x80;
const HEADER_J: u8 = 0x40;
const HEADER_Z: u8 = 0x20;

/// the payload did not decode; the packet gets dropped and counted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedPayload(pub String);

impl fmt::Display for MalformedPayload {
    // This trait requires `fmt` with this exact signature.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "malformed midi payload: {}", self.0)
    }
}

impl Error for MalformedPayload {}

/// decode the command section of an RTP-MIDI payload into typed events.
///
/// Stops quietly (with a warning) at the first status byte it does not
/// understand; everything decoded up to that point is returned.  Hard
/// framing problems return `MalformedPayload` and nothing is returned.
pub fn decode_payload(payload: &[u8]) -> Result<Vec<MidiEvent>, MalformedPayload> {
    if payload.is_empty() {
        return Err(MalformedPayload(String::from("empty payload")));
    }
    let header = payload[0];
    if header & HEADER_J != 0 {
        // a journal may be trailing the command section; without packet
        // recovery there is nothing to do with it
        log::debug!("payload carries a recovery journal, ignoring it");
    }
    let mut pos: usize = 1;
    let length: usize;
    if header & HEADER_B != 0 {
        if payload.len() < 2 {
            return Err(MalformedPayload(String::from("big length header cut short")));
        }
        length = (((header & 0x0F) as usize) << 8) | payload[1] as usize;
        pos = 2;
    } else {
        length = (header & 0x0F) as usize;
    }
    if pos + length > payload.len() {
        return Err(MalformedPayload(format!(
            "command section says {} bytes but only {} remain",
            length,
            payload.len() - pos
        )));
    }
    let end = pos + length;
    let mut events: Vec<MidiEvent> = vec![];
    let mut running_status: Option<u8> = None;
    let mut first = true;

    while pos < end {
        // delta time in front of every command except the first when Z set
        if !(first && (header & HEADER_Z != 0)) {
            let mut vlq_len = 0;
            loop {
                if pos >= end {
                    return Err(MalformedPayload(String::from("delta time runs off the end")));
                }
                let b = payload[pos];
                pos += 1;
                vlq_len += 1;
                if b & 0x80 == 0 {
                    break;
                }
                if vlq_len == 4 {
                    return Err(MalformedPayload(String::from("delta time longer than 4 bytes")));
                }
            }
            // the value itself is unused here; inter event timing inside one
            // packet is not modeled
        }
        first = false;
        if pos >= end {
            return Err(MalformedPayload(String::from("delta time with no command")));
        }
        let status = if payload[pos] & 0x80 != 0 {
            let s = payload[pos];
            pos += 1;
            running_status = Some(s);
            s
        } else {
            match running_status {
                Some(s) => s,
                None => {
                    return Err(MalformedPayload(String::from(
                        "running status before any status byte",
                    )));
                }
            }
        };
        let data_len = match MidiEvent::data_len(status) {
            Some(n) => n,
            None => {
                // not a channel voice command we know.  Deliver what we have.
                log::warn!("unknown midi status {:02X}, dropping rest of payload", status);
                return Ok(events);
            }
        };
        if pos + data_len > end {
            return Err(MalformedPayload(format!(
                "command {:02X} truncated",
                status
            )));
        }
        for i in 0..data_len {
            if payload[pos + i] & 0x80 != 0 {
                return Err(MalformedPayload(format!(
                    "data byte {:02X} has the status bit set",
                    payload[pos + i]
                )));
            }
        }
        match MidiEvent::from_status(status, &payload[pos..pos + data_len]) {
            Ok(ev) => events.push(ev),
            Err(e) => {
                log::warn!("undecodable midi command: {}", e);
                return Ok(events);
            }
        }
        pos += data_len;
    }
    Ok(events)
}

/// encode typed events into a command section (header byte included).
///
/// Z=1 so the first event needs no delta, every later event gets a zero
/// delta, statuses are always explicit, and the two byte length form kicks
/// in past 15 bytes.
pub fn encode_payload(events: &[MidiEvent]) -> Vec<u8> {
    let mut body: Vec<u8> = vec![];
    for (i, ev) in events.iter().enumerate() {
        if i > 0 {
            body.push(0); // zero delta time
        }
        ev.write_bytes(&mut body);
    }
    let mut out: Vec<u8> = vec![];
    if body.len() > 0x0F {
        out.push(HEADER_B | HEADER_Z | ((body.len() >> 8) & 0x0F) as u8);
        out.push((body.len() & 0xFF) as u8);
    } else {
        out.push(HEADER_Z | body.len() as u8);
    }
    out.extend_from_slice(&body);
    out
}

/// decode a plain command stream (running status, no delta times).
///
/// This is the form midi data travels in between router peers.
pub fn decode_commands(data: &[u8]) -> Result<Vec<MidiEvent>, MalformedPayload> {
    let mut events: Vec<MidiEvent> = vec![];
    let mut running_status: Option<u8> = None;
    let mut pos: usize = 0;
    while pos < data.len() {
        let status = if data[pos] & 0x80 != 0 {
            let s = data[pos];
            pos += 1;
            running_status = Some(s);
            s
        } else {
            match running_status {
                Some(s) => s,
                None => {
                    return Err(MalformedPayload(String::from(
                        "running status before any status byte",
                    )));
                }
            }
        };
        let data_len = match MidiEvent::data_len(status) {
            Some(n) => n,
            None => {
                log::warn!("unknown midi status {:02X} in command stream", status);
                return Ok(events);
            }
        };
        if pos + data_len > data.len() {
            return Err(MalformedPayload(format!("command {:02X} truncated", status)));
        }
        match MidiEvent::from_status(status, &data[pos..pos + data_len]) {
            Ok(ev) => events.push(ev),
            Err(e) => {
                log::warn!("undecodable midi command: {}", e);
                return Ok(events);
            }
        }
        pos += data_len;
    }
    Ok(events)
}

/// encode typed events into a plain command stream (no deltas, no header)
pub fn encode_commands(events: &[MidiEvent]) -> Vec<u8> {
    let mut out: Vec<u8> = vec![];
    for ev in events {
        ev.write_bytes(&mut out);
    }
    out
}

#[cfg(test)]
mod test_midi_stream {
    use super::*;

    #[test]
    fn decode_running_status() {
        // note on then running status note on with zero velocity (a note off)
        let payload = [0x26, 0x90, 0x3C, 0x40, 0x00, 0x3C, 0x00];
        let events = decode_payload(&payload).unwrap();
        assert_eq!(
            events,
            vec![
                MidiEvent::NoteOn {
                    channel: 0,
                    note: 60,
                    velocity: 64
                },
                MidiEvent::NoteOff {
                    channel: 0,
                    note: 60,
                    velocity: 0
                },
            ]
        );
    }
    #[test]
    fn decode_z_flag_clear() {
        // Z clear means even the first event has a delta in front
        let payload = [0x04, 0x00, 0x90, 0x3C, 0x40];
        let events = decode_payload(&payload).unwrap();
        assert_eq!(events.len(), 1);
    }
    #[test]
    fn length_larger_than_payload() {
        // header promises four bytes but only two follow
        let payload = [0x04, 0x90, 0x3C];
        let res = decode_payload(&payload);
        assert!(res.is_err());
    }
    #[test]
    fn running_status_without_status() {
        // a data byte first thing with nothing to run from
        let payload = [0x23, 0x3C, 0x40, 0x00];
        assert!(decode_payload(&payload).is_err());
    }
    #[test]
    fn truncated_command() {
        // note on with only one data byte inside the declared section
        let payload = [0x22, 0x90, 0x3C];
        assert!(decode_payload(&payload).is_err());
    }
    #[test]
    fn unknown_status_stops_cleanly() {
        // one good event, then a system message we do not speak
        let payload = [0x26, 0x90, 0x3C, 0x40, 0x00, 0xF8, 0x00];
        let events = decode_payload(&payload).unwrap();
        assert_eq!(events.len(), 1);
    }
    #[test]
    fn encode_then_decode() {
        // event level round trip through the payload coding
        let events = vec![
            MidiEvent::NoteOn {
                channel: 1,
                note: 64,
                velocity: 99,
            },
            MidiEvent::ControlChange {
                channel: 1,
                controller: 7,
                value: 127,
            },
            MidiEvent::PitchBend {
                channel: 1,
                value: -100,
            },
        ];
        let payload = encode_payload(&events);
        let back = decode_payload(&payload).unwrap();
        assert_eq!(back, events);
    }
    #[test]
    fn encode_long_payload_uses_big_length() {
        // 16 note ons is 48 bytes of commands plus deltas, past the nibble
        let events = vec![
            MidiEvent::NoteOn {
                channel: 0,
                note: 60,
                velocity: 64
            };
            16
        ];
        let payload = encode_payload(&events);
        assert!(payload[0] & 0x80 != 0);
        let back = decode_payload(&payload).unwrap();
        assert_eq!(back.len(), 16);
    }
    #[test]
    fn command_stream_round_trip() {
        let events = vec![
            MidiEvent::ProgramChange {
                channel: 3,
                program: 12,
            },
            MidiEvent::ChannelPressure {
                channel: 3,
                value: 55,
            },
        ];
        let bytes = encode_commands(&events);
        assert_eq!(decode_commands(&bytes).unwrap(), events);
    }
}
