//! the midi router: who is connected to whom, and event delivery.
//!
//! The router owns every peer outright and knows them by monotonically
//! assigned ids that are never reused.  Routes are directed edges; sending
//! from a peer copies the data to every route target in the order the
//! routes were added.  A peer that emits more midi while a delivery is in
//! flight gets queued, not recursed into, so delivery order stays
//! deterministic no matter what a peer does in its callback.
use std::collections::{BTreeMap, VecDeque};
use std::error::Error;
use std::fmt;

use crate::common::box_error::BoxError;
use crate::peers::midi_peer::{MidiData, MidiPeer, PeerId, RouterEvent};
use crate::sequencer::LocalPortId;
use crate::session::rtp_session::SessionChannel;

/// errors the control plane reports back to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    UnknownPeer(PeerId),
    WouldCycle,
}

impl fmt::Display for RouterError {
    // This trait requires `fmt` with this exact signature.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // these strings go straight into json-rpc error fields
        match self {
            RouterError::UnknownPeer(_id) => write!(f, "UnknownPeer"),
            RouterError::WouldCycle => write!(f, "WouldCycle"),
        }
    }
}

impl Error for RouterError {}

pub struct MidiRouter {
    peers: BTreeMap<PeerId, Box<dyn MidiPeer>>,
    routes: Vec<(PeerId, PeerId)>,
    next_id: PeerId,
    queue: VecDeque<(PeerId, MidiData)>,
    dispatching: bool,
}

impl MidiRouter {
    pub fn new() -> MidiRouter {
        MidiRouter {
            peers: BTreeMap::new(),
            routes: vec![],
            next_id: 0,
            queue: VecDeque::new(),
            dispatching: false,
        }
    }

    /// take ownership of a peer and hand it its id.  Never fails.
    pub fn add_peer(&mut self, mut peer: Box<dyn MidiPeer>) -> PeerId {
        let id = self.next_id;
        self.next_id += 1;
        peer.on_added(id);
        log::info!("router peer {} added ({})", id, peer.kind());
        self.peers.insert(id, peer);
        id
    }

    /// drop a peer and every route touching it.  No-op when absent.
    pub fn remove_peer(&mut self, id: PeerId, out: &mut Vec<RouterEvent>) -> () {
        if !self.peers.contains_key(&id) {
            return;
        }
        // routes first, and remember who lost an edge
        let mut affected: Vec<PeerId> = vec![];
        self.routes.retain(|(from, to)| {
            let incident = *from == id || *to == id;
            if incident {
                let other = if *from == id { *to } else { *from };
                affected.push(other);
            }
            !incident
        });
        if let Some(mut peer) = self.peers.remove(&id) {
            log::info!("router peer {} removed ({})", id, peer.kind());
            let mut events: Vec<RouterEvent> = vec![];
            peer.on_removed(&mut events);
            self.absorb(events, out);
        }
        for other in affected {
            self.notify_routes_changed(other, out);
        }
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    /// add a directed route.  Idempotent; refuses self routes and anything
    /// that would close a directed cycle.
    pub fn connect(&mut self, from: PeerId, to: PeerId) -> Result<(), RouterError> {
        if !self.peers.contains_key(&from) {
            return Err(RouterError::UnknownPeer(from));
        }
        if !self.peers.contains_key(&to) {
            return Err(RouterError::UnknownPeer(to));
        }
        if self.routes.contains(&(from, to)) {
            return Ok(());
        }
        if self.reaches(to, from) {
            return Err(RouterError::WouldCycle);
        }
        log::debug!("route added {} -> {}", from, to);
        self.routes.push((from, to));
        Ok(())
    }

    /// route change notifications need the event queue, so the control
    /// plane calls this wrapper
    pub fn connect_notified(
        &mut self,
        from: PeerId,
        to: PeerId,
        out: &mut Vec<RouterEvent>,
    ) -> Result<(), RouterError> {
        self.connect(from, to)?;
        self.notify_routes_changed(from, out);
        self.notify_routes_changed(to, out);
        Ok(())
    }

    /// remove a route; no-op when absent
    pub fn disconnect(&mut self, from: PeerId, to: PeerId, out: &mut Vec<RouterEvent>) -> () {
        let before = self.routes.len();
        self.routes.retain(|r| *r != (from, to));
        if self.routes.len() != before {
            log::debug!("route removed {} -> {}", from, to);
            self.notify_routes_changed(from, out);
            self.notify_routes_changed(to, out);
        }
    }

    /// true when `from` can already be reached by walking routes out of
    /// `start` (the cycle check: adding start->from would loop)
    fn reaches(&self, start: PeerId, wanted: PeerId) -> bool {
        if start == wanted {
            return true;
        }
        let mut stack = vec![start];
        let mut seen = vec![start];
        while let Some(node) = stack.pop() {
            for (from, to) in &self.routes {
                if *from == node && !seen.contains(to) {
                    if *to == wanted {
                        return true;
                    }
                    seen.push(*to);
                    stack.push(*to);
                }
            }
        }
        false
    }

    fn notify_routes_changed(&mut self, id: PeerId, out: &mut Vec<RouterEvent>) -> () {
        let incident = self
            .routes
            .iter()
            .filter(|(from, to)| *from == id || *to == id)
            .count();
        let mut events: Vec<RouterEvent> = vec![];
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.on_routes_changed(incident, &mut events);
        }
        self.absorb(events, out);
    }

    /// fan data out from a source to every route target, in route insertion
    /// order.  Midi a target emits while being delivered to is queued and
    /// delivered after, same ordering rule.
    pub fn send_midi_to(&mut self, from: PeerId, data: MidiData, out: &mut Vec<RouterEvent>) -> () {
        self.queue.push_back((from, data));
        if self.dispatching {
            return;
        }
        self.dispatching = true;
        while let Some((src, data)) = self.queue.pop_front() {
            let targets: Vec<PeerId> = self
                .routes
                .iter()
                .filter(|(f, _)| *f == src)
                .map(|(_, t)| *t)
                .collect();
            for target in targets {
                let mut events: Vec<RouterEvent> = vec![];
                if let Some(peer) = self.peers.get_mut(&target) {
                    peer.send_midi(src, &data, &mut events);
                }
                for ev in events {
                    match ev {
                        RouterEvent::Midi { from, data } => self.queue.push_back((from, data)),
                        other => out.push(other),
                    }
                }
            }
        }
        self.dispatching = false;
    }

    /// borrow a peer for inspection
    pub fn peer_by_id(&self, id: PeerId) -> Option<&dyn MidiPeer> {
        self.peers.get(&id).map(|peer| peer.as_ref())
    }

    /// dispatch a control plane verb to a peer
    pub fn peer_command(
        &mut self,
        id: PeerId,
        verb: &str,
        params: &serde_json::Value,
        out: &mut Vec<RouterEvent>,
    ) -> Result<serde_json::Value, BoxError> {
        let mut events: Vec<RouterEvent> = vec![];
        let result = match self.peers.get_mut(&id) {
            Some(peer) => peer.command(verb, params, &mut events),
            None => Err(Box::new(RouterError::UnknownPeer(id)) as BoxError),
        };
        self.absorb(events, out);
        result
    }

    /// give every peer a turn at its sockets and timers
    pub fn poll_all(&mut self, now: u128, out: &mut Vec<RouterEvent>) -> () {
        let ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        for id in ids {
            let mut events: Vec<RouterEvent> = vec![];
            if let Some(peer) = self.peers.get_mut(&id) {
                peer.poll(now, &mut events);
            }
            self.absorb(events, out);
        }
    }

    /// hand a demuxed datagram to the session peer that owns it
    pub fn deliver_datagram(
        &mut self,
        to: PeerId,
        channel: SessionChannel,
        bytes: &[u8],
        out: &mut Vec<RouterEvent>,
    ) -> () {
        let mut events: Vec<RouterEvent> = vec![];
        match self.peers.get_mut(&to) {
            Some(peer) => peer.handle_datagram(channel, bytes, &mut events),
            None => {
                // session already torn down, late datagram
                log::debug!("datagram for missing peer {}, dropped", to);
            }
        }
        self.absorb(events, out);
    }

    /// route a sequencer notification to whichever peer fronts that port
    pub fn deliver_seq_event(
        &mut self,
        port: LocalPortId,
        event: &crate::sequencer::SeqEvent,
        out: &mut Vec<RouterEvent>,
    ) -> () {
        let owner = self
            .peers
            .iter()
            .find(|(_, peer)| peer.local_port() == Some(port))
            .map(|(id, _)| *id);
        let mut events: Vec<RouterEvent> = vec![];
        if let Some(id) = owner {
            if let Some(peer) = self.peers.get_mut(&id) {
                peer.on_seq_event(event, &mut events);
            }
        } else {
            log::debug!("sequencer event for unclaimed port {}", port);
        }
        self.absorb(events, out);
    }

    /// notify a parent about its child's registration
    pub fn notify_child_added(
        &mut self,
        parent: PeerId,
        key: &crate::peers::midi_peer::ChildKey,
        child: PeerId,
    ) -> () {
        if let Some(peer) = self.peers.get_mut(&parent) {
            peer.on_child_added(key, child);
        }
    }

    /// notify a parent about its child's removal
    pub fn notify_child_removed(
        &mut self,
        parent: PeerId,
        key: &crate::peers::midi_peer::ChildKey,
    ) -> () {
        if let Some(peer) = self.peers.get_mut(&parent) {
            peer.on_child_removed(key);
        }
    }

    /// midi events produced inside a dispatch get re-queued, everything
    /// else bubbles up to the daemon loop
    fn absorb(&mut self, events: Vec<RouterEvent>, out: &mut Vec<RouterEvent>) -> () {
        for ev in events {
            match ev {
                RouterEvent::Midi { from, data } => self.send_midi_to(from, data, out),
                other => out.push(other),
            }
        }
    }

    /// structured report of the whole graph
    pub fn status(&self) -> serde_json::Value {
        let peers: Vec<serde_json::Value> = self
            .peers
            .iter()
            .map(|(id, peer)| {
                serde_json::json!({
                    "id": id,
                    "kind": peer.kind(),
                    "status": peer.status(),
                })
            })
            .collect();
        let routes: Vec<serde_json::Value> = self
            .routes
            .iter()
            .map(|(from, to)| serde_json::json!({"from": from, "to": to}))
            .collect();
        serde_json::json!({
            "peers": peers,
            "routes": routes,
        })
    }
}
