//! router peers fronting one local sequencer port.
//!
//! Routes form a directed acyclic graph, so one port shows the router two
//! faces: a source peer that turns what local clients play into router
//! midi, and a sink peer that plays routed midi out the port.  Wiring a
//! network peer between the two gives a bidirectional bridge without ever
//! closing a route cycle.
use crate::peers::midi_peer::{MidiData, MidiPeer, PeerId, RouterEvent};
use crate::sequencer::{LocalPortId, SeqEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortFace {
    Source,
    Sink,
}

pub struct LocalSequencerPeer {
    id: PeerId,
    port: LocalPortId,
    name: String,
    face: PortFace,
}

impl LocalSequencerPeer {
    /// the face that hears what local clients play
    pub fn source(name: &str, port: LocalPortId) -> LocalSequencerPeer {
        LocalSequencerPeer {
            id: 0,
            port,
            name: String::from(name),
            face: PortFace::Source,
        }
    }
    /// the face that plays routed midi to local clients
    pub fn sink(name: &str, port: LocalPortId) -> LocalSequencerPeer {
        LocalSequencerPeer {
            id: 0,
            port,
            name: String::from(name),
            face: PortFace::Sink,
        }
    }
}

impl MidiPeer for LocalSequencerPeer {
    fn kind(&self) -> &'static str {
        match self.face {
            PortFace::Source => "local_sequencer_in",
            PortFace::Sink => "local_sequencer_out",
        }
    }
    fn on_added(&mut self, id: PeerId) {
        self.id = id;
    }
    fn send_midi(&mut self, _from: PeerId, data: &MidiData, out: &mut Vec<RouterEvent>) {
        if self.face == PortFace::Source {
            log::debug!("midi routed into the source face of port {}, dropped", self.port);
            return;
        }
        match data.to_events() {
            Ok(events) => {
                for event in events {
                    out.push(RouterEvent::SeqSend {
                        port: self.port,
                        event,
                    });
                }
            }
            Err(e) => {
                log::warn!("{} on the way to port {}", e, self.port);
            }
        }
    }
    fn on_seq_event(&mut self, event: &SeqEvent, out: &mut Vec<RouterEvent>) {
        match event {
            SeqEvent::Midi { event, .. } => {
                out.push(RouterEvent::Midi {
                    from: self.id,
                    data: MidiData::from_events(&[*event]),
                });
            }
            // plain ports do not care who subscribes
            SeqEvent::Subscribed { name, .. } => {
                log::debug!("'{}' subscribed to port {}", name, self.port);
            }
            SeqEvent::Unsubscribed { name, .. } => {
                log::debug!("'{}' unsubscribed from port {}", name, self.port);
            }
        }
    }
    fn local_port(&self) -> Option<LocalPortId> {
        // only the source face takes sequencer events, so midi from local
        // clients enters the graph exactly once
        match self.face {
            PortFace::Source => Some(self.port),
            PortFace::Sink => None,
        }
    }
    fn on_removed(&mut self, out: &mut Vec<RouterEvent>) {
        // the source face owns the port's lifetime
        if self.face == PortFace::Source {
            out.push(RouterEvent::RemovePort { port: self.port });
        }
    }
    fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "port": self.port,
        })
    }
}
