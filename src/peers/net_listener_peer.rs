//! router peer that accepts inbound sessions and spawns a child peer per
//! remote.
//!
//! The listener is not a midi endpoint itself.  Each accepted remote
//! becomes a [`NetworkServerPeer`](crate::peers::net_server_peer::NetworkServerPeer)
//! wired bidirectionally against this peer's configured targets, so the
//! remote hears what the targets play and vice versa.
use serde_json::json;

use crate::common::box_error::BoxError;
use crate::peers::midi_peer::{ChildKey, MidiData, MidiPeer, PeerId, RouterEvent};
use crate::peers::net_server_peer::NetworkServerPeer;
use crate::session::rtp_listener::{ListenerEvent, RtpListener};

pub struct NetworkMultiListener {
    id: PeerId,
    name: String,
    listener: RtpListener,
    targets_in: Vec<PeerId>,
    targets_out: Vec<PeerId>,
    children: Vec<(u32, PeerId)>,
}

impl NetworkMultiListener {
    /// bind and listen.  Every accepted remote gets routes child -> each of
    /// `targets_in` and each of `targets_out` -> child.
    pub fn build(
        name: &str,
        port: u16,
        targets_in: Vec<PeerId>,
        targets_out: Vec<PeerId>,
    ) -> Result<NetworkMultiListener, BoxError> {
        let listener = RtpListener::build(name, port)?;
        Ok(NetworkMultiListener {
            id: 0,
            name: String::from(name),
            listener,
            targets_in,
            targets_out,
            children: vec![],
        })
    }

    pub fn control_port(&self) -> u16 {
        self.listener.control_port()
    }
}

impl MidiPeer for NetworkMultiListener {
    fn kind(&self) -> &'static str {
        "network_listener"
    }
    fn on_added(&mut self, id: PeerId) {
        self.id = id;
    }
    fn send_midi(&mut self, _from: PeerId, _data: &MidiData, _out: &mut Vec<RouterEvent>) {
        // nothing to do; the children carry the sessions
        log::debug!("midi routed to listener '{}' itself, dropped", self.name);
    }
    fn poll(&mut self, now: u128, out: &mut Vec<RouterEvent>) {
        for event in self.listener.poll(now) {
            match event {
                ListenerEvent::NewSession {
                    session,
                    remote_control,
                    remote_data,
                    ssrc,
                } => {
                    let (control_sock, data_sock) = match self.listener.clone_socks() {
                        Ok(socks) => socks,
                        Err(e) => {
                            log::error!("cannot clone listener sockets: {}", e);
                            continue;
                        }
                    };
                    let remote_name = String::from(session.remote_name());
                    let child = NetworkServerPeer::build(
                        self.id,
                        ssrc,
                        session,
                        control_sock,
                        data_sock,
                        remote_control,
                        remote_data,
                    );
                    out.push(RouterEvent::NewChild {
                        parent: self.id,
                        peer: Box::new(child),
                        name: remote_name,
                        targets_in: self.targets_in.clone(),
                        targets_out: self.targets_out.clone(),
                        key: ChildKey::Ssrc(ssrc),
                    });
                }
                ListenerEvent::ForChild {
                    child,
                    channel,
                    bytes,
                } => {
                    out.push(RouterEvent::Datagram {
                        to: child,
                        channel,
                        bytes,
                    });
                }
            }
        }
    }
    fn on_child_added(&mut self, key: &ChildKey, child: PeerId) {
        if let ChildKey::Ssrc(ssrc) = key {
            self.listener.register_child(*ssrc, child);
            self.children.push((*ssrc, child));
        }
    }
    fn on_child_removed(&mut self, key: &ChildKey) {
        if let ChildKey::Ssrc(ssrc) = key {
            self.listener.unregister_child(*ssrc);
            self.children.retain(|(s, _)| s != ssrc);
        }
    }
    fn command(
        &mut self,
        verb: &str,
        params: &serde_json::Value,
        _out: &mut Vec<RouterEvent>,
    ) -> Result<serde_json::Value, BoxError> {
        match verb {
            "accepting" => {
                if let Some(flag) = params.as_bool() {
                    self.listener.set_accepting(flag);
                }
                Ok(json!(self.listener.is_accepting()))
            }
            _ => {
                simple_error::bail!("unknown command '{}'", verb)
            }
        }
    }
    fn status(&self) -> serde_json::Value {
        let mut report = self.listener.status_json();
        report["name"] = json!(self.name);
        report["targets_in"] = json!(self.targets_in);
        report["targets_out"] = json!(self.targets_out);
        report
    }
    fn on_removed(&mut self, out: &mut Vec<RouterEvent>) {
        // take the children down with us, their sessions are dead without
        // the bound sockets
        for (_ssrc, child) in &self.children {
            out.push(RouterEvent::RemovePeer { id: *child });
        }
    }
}
