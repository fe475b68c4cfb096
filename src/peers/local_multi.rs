//! router peer for the shared "Network" sequencer port.
//!
//! Local clients that subscribe to this port each get their own network
//! listener spawned and announced over mdns, so plugging a local synth
//! into the port is all it takes to put it on the network.  This peer is
//! the port's source face; a companion sink peer (created alongside it)
//! carries the return direction, and accepted remotes get wired between
//! the two.
use std::collections::HashMap;

use serde_json::json;

use crate::peers::midi_peer::{ChildKey, MidiData, MidiPeer, PeerId, RouterEvent};
use crate::peers::net_listener_peer::NetworkMultiListener;
use crate::sequencer::{LocalPortId, SeqEvent};

pub struct LocalMultiListener {
    id: PeerId,
    name: String,
    port: LocalPortId,
    /// sink face of the same port; spawned listeners route remotes there
    sink: PeerId,
    /// subscriber name -> (router id of the spawned listener, its port)
    children: HashMap<String, (PeerId, u16)>,
}

impl LocalMultiListener {
    pub fn build(name: &str, port: LocalPortId, sink: PeerId) -> LocalMultiListener {
        LocalMultiListener {
            id: 0,
            name: String::from(name),
            port,
            sink,
            children: HashMap::new(),
        }
    }
}

impl MidiPeer for LocalMultiListener {
    fn kind(&self) -> &'static str {
        "local_multi_listener"
    }
    fn on_added(&mut self, id: PeerId) {
        self.id = id;
    }
    fn send_midi(&mut self, _from: PeerId, _data: &MidiData, _out: &mut Vec<RouterEvent>) {
        // the sink face handles the return direction
        log::debug!("midi routed into the source face of '{}', dropped", self.name);
    }
    fn on_seq_event(&mut self, event: &SeqEvent, out: &mut Vec<RouterEvent>) {
        match event {
            SeqEvent::Subscribed { name, .. } => {
                if self.children.contains_key(name) {
                    log::debug!("'{}' already has a listener", name);
                    return;
                }
                // each subscriber gets its own announced listener; remotes
                // it accepts are wired between our two faces
                match NetworkMultiListener::build(name, 0, vec![self.sink], vec![self.id]) {
                    Ok(listener) => {
                        let port = listener.control_port();
                        log::info!("'{}' subscribed, exported on port {}", name, port);
                        out.push(RouterEvent::NewChild {
                            parent: self.id,
                            peer: Box::new(listener),
                            name: name.clone(),
                            targets_in: vec![],
                            targets_out: vec![],
                            key: ChildKey::Name(name.clone()),
                        });
                        out.push(RouterEvent::Announce {
                            name: name.clone(),
                            port,
                        });
                        // id gets filled in by on_child_added
                        self.children.insert(name.clone(), (0, port));
                    }
                    Err(e) => {
                        log::error!("cannot export '{}': {}", name, e);
                    }
                }
            }
            SeqEvent::Unsubscribed { name, .. } => {
                if let Some((child, port)) = self.children.remove(name) {
                    log::info!("'{}' unsubscribed, retiring its listener", name);
                    out.push(RouterEvent::RemovePeer { id: child });
                    out.push(RouterEvent::Unannounce {
                        name: name.clone(),
                        port,
                    });
                }
            }
            SeqEvent::Midi { event, .. } => {
                // local playing toward whatever remotes are connected
                out.push(RouterEvent::Midi {
                    from: self.id,
                    data: MidiData::from_events(&[*event]),
                });
            }
        }
    }
    fn on_child_added(&mut self, key: &ChildKey, child: PeerId) {
        if let ChildKey::Name(name) = key {
            if let Some(entry) = self.children.get_mut(name) {
                entry.0 = child;
            }
        }
    }
    fn on_child_removed(&mut self, key: &ChildKey) {
        if let ChildKey::Name(name) = key {
            self.children.remove(name);
        }
    }
    fn local_port(&self) -> Option<LocalPortId> {
        Some(self.port)
    }
    fn on_removed(&mut self, out: &mut Vec<RouterEvent>) {
        for (name, (child, port)) in self.children.drain() {
            out.push(RouterEvent::RemovePeer { id: child });
            out.push(RouterEvent::Unannounce { name, port });
        }
        out.push(RouterEvent::RemovePort { port: self.port });
    }
    fn status(&self) -> serde_json::Value {
        json!({
            "name": self.name,
            "port": self.port,
            "exports": self.children.keys().collect::<Vec<&String>>(),
        })
    }
}
