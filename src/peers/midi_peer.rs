//! the common face every router peer shows.
//!
//! Peers never hold references to each other or to the router; they know
//! other peers by id only.  Anything a peer wants done that it cannot do
//! with what it owns (more routing, new peers, sequencer or mdns work)
//! goes out as a [`RouterEvent`] for the daemon loop to carry out.  That
//! keeps ownership a straight line: router owns peers, peers own sockets
//! and sessions.
use std::fmt;

use simple_error::bail;

use crate::common::box_error::BoxError;
use crate::common::midi_event::MidiEvent;
use crate::common::midi_stream::{self, MalformedPayload};
use crate::sequencer::LocalPortId;
use crate::session::rtp_session::SessionChannel;

pub type PeerId = u32;

/// an immutable run of MIDI commands in plain running-status bytes.
///
/// This is what travels between peers; no timestamps, no channel metadata
/// beyond what the bytes themselves say.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiData(Vec<u8>);

impl MidiData {
    pub fn new(bytes: Vec<u8>) -> MidiData {
        MidiData(bytes)
    }
    pub fn from_events(events: &[MidiEvent]) -> MidiData {
        MidiData(midi_stream::encode_commands(events))
    }
    pub fn to_events(&self) -> Result<Vec<MidiEvent>, MalformedPayload> {
        midi_stream::decode_commands(&self.0)
    }
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for MidiData {
    // This trait requires `fmt` with this exact signature.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        for b in &self.0 {
            write!(f, " {:02X}", b)?;
        }
        write!(f, " ]")
    }
}

/// how a parent identifies one of its spawned children
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildKey {
    /// network listener children go by remote ssrc
    Ssrc(u32),
    /// local multi listener children go by subscriber name
    Name(String),
}

/// deferred work a peer hands back to the daemon loop
pub enum RouterEvent {
    /// midi entering the graph from this source
    Midi { from: PeerId, data: MidiData },
    /// raw datagram that belongs to another peer's session
    Datagram {
        to: PeerId,
        channel: SessionChannel,
        bytes: Vec<u8>,
    },
    /// a spawning peer produced a child; add it and wire it up.
    /// `targets_in` get routes child -> t, `targets_out` get t -> child;
    /// the split keeps the route graph a dag.
    NewChild {
        parent: PeerId,
        peer: Box<dyn MidiPeer>,
        name: String,
        targets_in: Vec<PeerId>,
        targets_out: Vec<PeerId>,
        key: ChildKey,
    },
    /// tell a parent that one of its children is gone
    ChildClosed { parent: PeerId, key: ChildKey },
    /// take this peer out of the router
    RemovePeer { id: PeerId },
    /// push one event out a local sequencer port
    SeqSend { port: LocalPortId, event: MidiEvent },
    /// drop a local sequencer port
    RemovePort { port: LocalPortId },
    /// publish a service over mdns
    Announce { name: String, port: u16 },
    /// retract a published service
    Unannounce { name: String, port: u16 },
    /// control plane asked for an outbound connection to be created
    ConnectRequest {
        name: String,
        hostname: String,
        port: String,
    },
}

/// capability set shared by every peer kind
pub trait MidiPeer {
    /// short tag for status reports
    fn kind(&self) -> &'static str;
    /// the router hands out the id right after taking ownership
    fn on_added(&mut self, _id: PeerId) {}
    /// midi routed to this peer from `from`
    fn send_midi(&mut self, from: PeerId, data: &MidiData, out: &mut Vec<RouterEvent>);
    /// structured report for the control plane
    fn status(&self) -> serde_json::Value;
    /// peer specific verbs from the control plane
    fn command(
        &mut self,
        verb: &str,
        _params: &serde_json::Value,
        _out: &mut Vec<RouterEvent>,
    ) -> Result<serde_json::Value, BoxError> {
        bail!("unknown command '{}'", verb)
    }
    /// drive sockets and timers; called every loop tick
    fn poll(&mut self, _now: u128, _out: &mut Vec<RouterEvent>) {}
    /// the number of routes touching this peer changed
    fn on_routes_changed(&mut self, _incident: usize, _out: &mut Vec<RouterEvent>) {}
    /// a datagram demuxed by a parent listener for this peer's session
    fn handle_datagram(
        &mut self,
        _channel: SessionChannel,
        _bytes: &[u8],
        _out: &mut Vec<RouterEvent>,
    ) {
        log::debug!("datagram for a peer that does not take them, dropped");
    }
    /// a child this peer spawned is now registered under `child`
    fn on_child_added(&mut self, _key: &ChildKey, _child: PeerId) {}
    /// a child this peer spawned went away
    fn on_child_removed(&mut self, _key: &ChildKey) {}
    /// a sequencer notification for this peer's local port
    fn on_seq_event(&mut self, _event: &crate::sequencer::SeqEvent, _out: &mut Vec<RouterEvent>) {}
    /// which local sequencer port this peer fronts, if any
    fn local_port(&self) -> Option<LocalPortId> {
        None
    }
    /// about to be dropped; last chance to say goodbye on the wire
    fn on_removed(&mut self, _out: &mut Vec<RouterEvent>) {}
}

#[cfg(test)]
mod test_midi_data {
    use super::*;

    #[test]
    fn round_trip_events() {
        let events = vec![
            MidiEvent::NoteOn {
                channel: 0,
                note: 60,
                velocity: 64,
            },
            MidiEvent::NoteOff {
                channel: 0,
                note: 60,
                velocity: 0,
            },
        ];
        let data = MidiData::from_events(&events);
        assert_eq!(data.to_events().unwrap(), events);
    }
    #[test]
    fn display_is_hex() {
        let data = MidiData::new(vec![0x90, 0x3C, 0x40]);
        assert_eq!(format!("{}", data), "[ 90 3C 40 ]");
    }
}
