//! router peer for one inbound session a listener accepted.
//!
//! The listener keeps the bound sockets and hands this peer clones for
//! sending; received datagrams come in through handle_datagram after the
//! listener demuxes them by ssrc.  The session state machine does the rest.
use std::net::{SocketAddr, UdpSocket};

use serde_json::json;

use crate::peers::midi_peer::{ChildKey, MidiData, MidiPeer, PeerId, RouterEvent};
use crate::session::rtp_client::CK_MISSED_USEC;
use crate::session::rtp_session::{
    DisconnectReason, RtpSession, SessionChannel, SessionOut, SessionStatus,
};

pub struct NetworkServerPeer {
    id: PeerId,
    parent: PeerId,
    ssrc: u32,
    session: RtpSession,
    control_sock: UdpSocket,
    data_sock: UdpSocket,
    remote_control: SocketAddr,
    remote_data: SocketAddr,
    /// set once we have told the daemon to take us out
    closing: bool,
}

impl NetworkServerPeer {
    pub fn build(
        parent: PeerId,
        ssrc: u32,
        session: RtpSession,
        control_sock: UdpSocket,
        data_sock: UdpSocket,
        remote_control: SocketAddr,
        remote_data: SocketAddr,
    ) -> NetworkServerPeer {
        NetworkServerPeer {
            id: 0,
            parent,
            ssrc,
            session,
            control_sock,
            data_sock,
            remote_control,
            remote_data,
            closing: false,
        }
    }

    fn apply_outs(&mut self, outs: Vec<SessionOut>, out: &mut Vec<RouterEvent>) -> () {
        for o in outs {
            match o {
                SessionOut::Control(bytes) => {
                    let _res = self.control_sock.send_to(&bytes, self.remote_control);
                }
                SessionOut::Data(bytes) => {
                    let _res = self.data_sock.send_to(&bytes, self.remote_data);
                }
                SessionOut::Midi(events) => {
                    out.push(RouterEvent::Midi {
                        from: self.id,
                        data: MidiData::from_events(&events),
                    });
                }
            }
        }
    }

    fn close(&mut self, out: &mut Vec<RouterEvent>) -> () {
        if self.closing {
            return;
        }
        self.closing = true;
        out.push(RouterEvent::RemovePeer { id: self.id });
    }
}

impl MidiPeer for NetworkServerPeer {
    fn kind(&self) -> &'static str {
        "network_server"
    }
    fn on_added(&mut self, id: PeerId) {
        self.id = id;
    }
    fn send_midi(&mut self, _from: PeerId, data: &MidiData, _out: &mut Vec<RouterEvent>) {
        if !self.session.is_connected() {
            return;
        }
        match data.to_events() {
            Ok(events) => {
                let packet = self.session.make_midi_packet(&events);
                if let Err(e) = self.data_sock.send_to(&packet, self.remote_data) {
                    log::warn!("could not send midi to {}: {}", self.remote_data, e);
                }
            }
            Err(e) => {
                log::warn!("{} on the way to {}", e, self.session.remote_name());
            }
        }
    }
    fn handle_datagram(
        &mut self,
        channel: SessionChannel,
        bytes: &[u8],
        out: &mut Vec<RouterEvent>,
    ) {
        let outs = self.session.advance(channel, bytes);
        self.apply_outs(outs, out);
        if let SessionStatus::Disconnected(reason) = self.session.status() {
            log::info!(
                "inbound session from {} over: {:?}",
                self.session.remote_name(),
                reason
            );
            self.close(out);
        }
    }
    fn poll(&mut self, now: u128, out: &mut Vec<RouterEvent>) {
        // the remote initiator is supposed to keep the clock sync coming;
        // three silent periods means it is gone
        if self.session.is_connected()
            && self.session.last_sync_time() > 0
            && now.saturating_sub(self.session.last_sync_time()) > CK_MISSED_USEC
        {
            log::warn!(
                "no clock sync from {} in 30s, dropping session",
                self.session.remote_name()
            );
            let bye = self.session.disconnect();
            let _res = self.control_sock.send_to(&bye, self.remote_control);
            let _res = self.data_sock.send_to(&bye, self.remote_data);
            self.session.mark_timed_out(DisconnectReason::CkTimeout);
            self.close(out);
        }
    }
    fn status(&self) -> serde_json::Value {
        let mut report = self.session.status_json();
        report["remote"] = json!(format!("{}", self.remote_control));
        report
    }
    fn on_removed(&mut self, out: &mut Vec<RouterEvent>) {
        if self.session.is_connected() {
            let bye = self.session.disconnect();
            let _res = self.control_sock.send_to(&bye, self.remote_control);
            let _res = self.data_sock.send_to(&bye, self.remote_data);
        }
        out.push(RouterEvent::ChildClosed {
            parent: self.parent,
            key: ChildKey::Ssrc(self.ssrc),
        });
    }
}

#[cfg(test)]
mod test_net_server_peer {
    use super::*;
    use crate::common::apple_midi::{ClockSync, SessionMessage};
    use crate::common::midi_event::MidiEvent;
    use crate::common::midi_stream;
    use crate::common::rtp_packet::RtpPacket;
    use std::time::Duration;

    /// a connected server peer plus the two remote sockets talking to it
    fn connected_peer() -> (NetworkServerPeer, UdpSocket, UdpSocket) {
        let remote_ctl = UdpSocket::bind("127.0.0.1:0").unwrap();
        let remote_data = UdpSocket::bind("127.0.0.1:0").unwrap();
        remote_ctl
            .set_read_timeout(Some(Duration::new(2, 0)))
            .unwrap();
        remote_data
            .set_read_timeout(Some(Duration::new(2, 0)))
            .unwrap();
        let local_ctl = UdpSocket::bind("127.0.0.1:0").unwrap();
        let local_data = UdpSocket::bind("127.0.0.1:0").unwrap();

        let mut session = RtpSession::build("room");
        // walk the responder handshake with literal invitations
        let inv = SessionMessage::Invitation(crate::common::apple_midi::Invitation {
            initiator_token: 0xCAFE,
            ssrc: 0xAA55,
            name: String::from("Alice"),
        })
        .to_bytes();
        let _res = session.advance(SessionChannel::Control, &inv);
        let _res = session.advance(SessionChannel::Data, &inv);
        assert!(session.is_connected());

        let peer = NetworkServerPeer::build(
            1,
            0xAA55,
            session,
            local_ctl,
            local_data,
            remote_ctl.local_addr().unwrap(),
            remote_data.local_addr().unwrap(),
        );
        (peer, remote_ctl, remote_data)
    }

    #[test]
    fn midi_goes_out_the_data_socket() {
        let (mut peer, _remote_ctl, remote_data) = connected_peer();
        peer.on_added(7);
        let mut out = vec![];
        let data = MidiData::from_events(&[MidiEvent::NoteOn {
            channel: 0,
            note: 60,
            velocity: 64,
        }]);
        peer.send_midi(0, &data, &mut out);
        let mut buf = [0u8; 256];
        let (amt, _src) = remote_data.recv_from(&mut buf).unwrap();
        // rtp header with the session's local ssrc and our payload behind it
        assert_eq!(buf[1], 0x61);
        let events = midi_stream::decode_payload(&buf[12..amt]).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn inbound_datagram_becomes_router_midi() {
        let (mut peer, _remote_ctl, _remote_data) = connected_peer();
        peer.on_added(7);
        let mut out = vec![];
        let mut packet = RtpPacket::build();
        packet.set_ssrc(0xAA55);
        packet.set_sequence_num(1);
        packet
            .set_payload(&midi_stream::encode_payload(&[MidiEvent::NoteOff {
                channel: 2,
                note: 33,
                velocity: 0,
            }]))
            .unwrap();
        let bytes = packet.get_send_buffer().to_vec();
        peer.handle_datagram(SessionChannel::Data, &bytes, &mut out);
        assert_eq!(out.len(), 1);
        match &out[0] {
            RouterEvent::Midi { from, .. } => assert_eq!(*from, 7),
            _ => panic!("expected midi"),
        }
    }

    #[test]
    fn clock_sync_gets_answered() {
        let (mut peer, _remote_ctl, remote_data) = connected_peer();
        let mut out = vec![];
        let ck0 = SessionMessage::ClockSync(ClockSync {
            ssrc: 0xAA55,
            count: 0,
            t1: 5000,
            t2: 0,
            t3: 0,
        })
        .to_bytes();
        peer.handle_datagram(SessionChannel::Data, &ck0, &mut out);
        let mut buf = [0u8; 64];
        let (_amt, _src) = remote_data.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[2..4], b"CK");
        assert_eq!(buf[8], 1);
    }

    #[test]
    fn goodbye_closes_the_peer() {
        let (mut peer, _remote_ctl, _remote_data) = connected_peer();
        peer.on_added(7);
        let mut out = vec![];
        let by = SessionMessage::Goodbye {
            initiator_token: 0xCAFE,
            ssrc: 0xAA55,
        }
        .to_bytes();
        peer.handle_datagram(SessionChannel::Control, &by, &mut out);
        assert!(out
            .iter()
            .any(|e| matches!(e, RouterEvent::RemovePeer { id: 7 })));
    }

    #[test]
    fn removal_notifies_the_parent() {
        let (mut peer, _remote_ctl, _remote_data) = connected_peer();
        peer.on_added(7);
        let mut out = vec![];
        peer.on_removed(&mut out);
        match &out[0] {
            RouterEvent::ChildClosed { parent, key } => {
                assert_eq!(*parent, 1);
                assert_eq!(*key, ChildKey::Ssrc(0xAA55));
            }
            _ => panic!("expected child closed"),
        }
    }
}
