//! router peer wrapping an outbound session.
//!
//! The session only runs while somebody is actually routed to or from this
//! peer: the first incident route dials out, losing the last one hangs up.
//! The control plane can also force a reconnect after a failure.
use serde_json::json;

use crate::common::stream_time_stat::get_micro_time;
use crate::peers::midi_peer::{MidiData, MidiPeer, PeerId, RouterEvent};
use crate::session::rtp_client::{ClientEvent, RtpClient};
use crate::session::rtp_session::SessionStatus;

pub struct NetworkClientPeer {
    id: PeerId,
    name: String,
    client: RtpClient,
    wanted: bool,
}

impl NetworkClientPeer {
    pub fn build(name: &str, endpoints: Vec<(String, String)>) -> NetworkClientPeer {
        NetworkClientPeer {
            id: 0,
            name: String::from(name),
            client: RtpClient::build(name, endpoints, get_micro_time()),
            wanted: false,
        }
    }

    fn start_if_idle(&mut self) -> () {
        match self.client.session().status() {
            SessionStatus::NotConnected | SessionStatus::Disconnected(_) => {
                if let Err(e) = self.client.reconnect(get_micro_time()) {
                    log::warn!("cannot connect '{}': {}", self.name, e);
                }
            }
            _ => {}
        }
    }
}

impl MidiPeer for NetworkClientPeer {
    fn kind(&self) -> &'static str {
        "network_client"
    }
    fn on_added(&mut self, id: PeerId) {
        self.id = id;
    }
    fn send_midi(&mut self, _from: PeerId, data: &MidiData, _out: &mut Vec<RouterEvent>) {
        match data.to_events() {
            Ok(events) => self.client.send_midi(&events),
            Err(e) => {
                log::warn!("{} on the way to '{}'", e, self.name);
            }
        }
    }
    fn on_routes_changed(&mut self, incident: usize, _out: &mut Vec<RouterEvent>) {
        if incident > 0 && !self.wanted {
            self.wanted = true;
            log::debug!("first route for '{}', connecting", self.name);
            self.start_if_idle();
        } else if incident == 0 && self.wanted {
            self.wanted = false;
            log::debug!("last route for '{}' gone, disconnecting", self.name);
            self.client.disconnect();
        }
    }
    fn poll(&mut self, now: u128, out: &mut Vec<RouterEvent>) {
        for event in self.client.poll(now) {
            match event {
                ClientEvent::Midi(events) => {
                    out.push(RouterEvent::Midi {
                        from: self.id,
                        data: MidiData::from_events(&events),
                    });
                }
                ClientEvent::Disconnected(reason) => {
                    log::info!("'{}' session ended: {:?}", self.name, reason);
                }
                ClientEvent::ConnectFailed => {
                    log::warn!("'{}' is unreachable", self.name);
                }
            }
        }
    }
    fn command(
        &mut self,
        verb: &str,
        _params: &serde_json::Value,
        _out: &mut Vec<RouterEvent>,
    ) -> Result<serde_json::Value, crate::common::box_error::BoxError> {
        match verb {
            "reconnect" => {
                self.client.reconnect(get_micro_time())?;
                Ok(json!("ok"))
            }
            "disconnect" => {
                self.client.disconnect();
                Ok(json!("ok"))
            }
            _ => {
                simple_error::bail!("unknown command '{}'", verb)
            }
        }
    }
    fn status(&self) -> serde_json::Value {
        let mut report = self.client.status_json();
        report["name"] = json!(self.name);
        report
    }
    fn on_removed(&mut self, _out: &mut Vec<RouterEvent>) {
        self.client.disconnect();
    }
}
