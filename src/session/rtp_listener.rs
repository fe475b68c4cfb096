//! inbound session acceptor.
//!
//! One bound control/data socket pair serves any number of remote peers;
//! datagrams are told apart by the SSRC every AppleMIDI and RTP message
//! carries.  A remote that completes the two step invitation gets promoted
//! to its own session, which the owner turns into a router peer.  From then
//! on the listener just hands that peer its datagrams.
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};

use byteorder::{ByteOrder, NetworkEndian};

use crate::common::apple_midi::is_session_message;
use crate::common::box_error::BoxError;
use crate::common::sock_with_tos;
use crate::session::rtp_session::{RtpSession, SessionChannel, SessionOut};

/// an invitation that never finishes gets swept after this long
const PENDING_TIMEOUT_USEC: u128 = 30_000_000;

/// what fell out of a poll
#[derive(Debug)]
pub enum ListenerEvent {
    /// a remote finished the handshake; the owner should wrap this session
    /// in a peer and register it
    NewSession {
        session: RtpSession,
        remote_control: SocketAddr,
        remote_data: SocketAddr,
        ssrc: u32,
    },
    /// datagram for a session that was already promoted
    ForChild {
        child: u32,
        channel: SessionChannel,
        bytes: Vec<u8>,
    },
}

struct PendingSession {
    session: RtpSession,
    remote_control: SocketAddr,
    remote_data: Option<SocketAddr>,
    created: u128,
}

pub struct RtpListener {
    local_name: String,
    control_sock: UdpSocket,
    data_sock: UdpSocket,
    control_port: u16,
    accepting: bool,
    pending: HashMap<u32, PendingSession>,
    children: HashMap<u32, u32>,
}

impl RtpListener {
    /// bind the pair and start listening.  Port 0 lets the kernel pick and
    /// the real port is read back for discovery to announce.
    pub fn build(local_name: &str, port: u16) -> Result<RtpListener, BoxError> {
        let (control_sock, data_sock) = sock_with_tos::new_pair(port)?;
        let control_port = control_sock.local_addr()?.port();
        log::info!("listening for rtp midi on ports {}/{}", control_port, control_port + 1);
        Ok(RtpListener {
            local_name: String::from(local_name),
            control_sock,
            data_sock,
            control_port,
            accepting: true,
            pending: HashMap::new(),
            children: HashMap::new(),
        })
    }

    pub fn control_port(&self) -> u16 {
        self.control_port
    }
    pub fn set_accepting(&mut self, accepting: bool) -> () {
        self.accepting = accepting;
    }
    pub fn is_accepting(&self) -> bool {
        self.accepting
    }
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// socket clones for a freshly promoted child peer
    pub fn clone_socks(&self) -> Result<(UdpSocket, UdpSocket), BoxError> {
        Ok((self.control_sock.try_clone()?, self.data_sock.try_clone()?))
    }

    /// remember which router peer owns an ssrc
    pub fn register_child(&mut self, ssrc: u32, peer_id: u32) -> () {
        self.children.insert(ssrc, peer_id);
    }
    pub fn unregister_child(&mut self, ssrc: u32) -> () {
        self.children.remove(&ssrc);
    }

    /// service both sockets.  Call every tick.
    pub fn poll(&mut self, now: u128) -> Vec<ListenerEvent> {
        let mut events: Vec<ListenerEvent> = vec![];
        self.pump(SessionChannel::Control, now, &mut events);
        self.pump(SessionChannel::Data, now, &mut events);
        // sweep handshakes that went quiet
        self.pending.retain(|ssrc, p| {
            let keep = now.saturating_sub(p.created) < PENDING_TIMEOUT_USEC;
            if !keep {
                log::debug!("invitation from ssrc {:08X} never completed, dropping", ssrc);
            }
            keep
        });
        events
    }

    fn pump(&mut self, channel: SessionChannel, now: u128, events: &mut Vec<ListenerEvent>) -> () {
        let mut buf = [0u8; 1500];
        loop {
            let recv = {
                let sock = match channel {
                    SessionChannel::Control => &self.control_sock,
                    SessionChannel::Data => &self.data_sock,
                };
                sock.recv_from(&mut buf)
            };
            match recv {
                Ok((amt, src)) => {
                    self.handle_datagram(channel, &buf[..amt], src, now, events);
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => return,
                    _ => {
                        log::warn!("listener socket error on {:?}: {}", channel, e);
                        return;
                    }
                },
            }
        }
    }

    fn handle_datagram(
        &mut self,
        channel: SessionChannel,
        data: &[u8],
        src: SocketAddr,
        now: u128,
        events: &mut Vec<ListenerEvent>,
    ) -> () {
        let ssrc = match peek_ssrc(data) {
            Some(s) => s,
            None => {
                log::debug!("undecipherable datagram from {}, dropped", src);
                return;
            }
        };
        // promoted sessions get their traffic handed over
        if let Some(child) = self.children.get(&ssrc) {
            events.push(ListenerEvent::ForChild {
                child: *child,
                channel,
                bytes: data.to_vec(),
            });
            return;
        }
        // otherwise this is (part of) a handshake
        if let Some(pending) = self.pending.get_mut(&ssrc) {
            if channel == SessionChannel::Data {
                pending.remote_data = Some(src);
            }
            let outs = pending.session.advance(channel, data);
            let remote_control = pending.remote_control;
            self.send_outs(outs, remote_control, Some(src));
            let done = self.pending.get(&ssrc).map(|p| p.session.is_connected()).unwrap_or(false);
            if done {
                let pending = self.pending.remove(&ssrc).unwrap();
                // the handshake only completes off a data-channel packet
                debug_assert!(pending.remote_data.is_some());
                let remote_data = pending.remote_data.unwrap_or(src);
                log::info!(
                    "accepted session from {} at {}",
                    pending.session.remote_name(),
                    pending.remote_control
                );
                events.push(ListenerEvent::NewSession {
                    session: pending.session,
                    remote_control: pending.remote_control,
                    remote_data,
                    ssrc,
                });
            }
            return;
        }
        // a brand new remote has to start with IN on the control port
        if channel == SessionChannel::Control && is_invitation(data) {
            if !self.accepting {
                let no = crate::common::apple_midi::SessionMessage::Rejected(
                    crate::common::apple_midi::Invitation {
                        initiator_token: peek_token(data).unwrap_or(0),
                        ssrc: 0,
                        name: String::from(&self.local_name),
                    },
                )
                .to_bytes();
                let _res = self.control_sock.send_to(&no, src);
                return;
            }
            let mut pending = PendingSession {
                session: RtpSession::build(&self.local_name),
                remote_control: src,
                remote_data: None,
                created: now,
            };
            let outs = pending.session.advance(channel, data);
            self.send_outs(outs, src, None);
            self.pending.insert(ssrc, pending);
            return;
        }
        log::debug!("datagram from unknown ssrc {:08X} on {:?}, dropped", ssrc, channel);
    }

    fn send_outs(
        &self,
        outs: Vec<SessionOut>,
        remote_control: SocketAddr,
        remote_data: Option<SocketAddr>,
    ) -> () {
        for out in outs {
            match out {
                SessionOut::Control(bytes) => {
                    let _res = self.control_sock.send_to(&bytes, remote_control);
                }
                SessionOut::Data(bytes) => {
                    if let Some(addr) = remote_data {
                        let _res = self.data_sock.send_to(&bytes, addr);
                    }
                }
                SessionOut::Midi(_) => {
                    // no midi before the handshake is done
                }
            }
        }
    }

    pub fn status_json(&self) -> serde_json::Value {
        serde_json::json!({
            "port": self.control_port,
            "accepting": self.accepting,
            "sessions": self.children.len(),
            "pending": self.pending.len(),
        })
    }
}

/// every message in the protocol carries the sender's ssrc somewhere
fn peek_ssrc(data: &[u8]) -> Option<u32> {
    if is_session_message(data) {
        let cmd = [data[2], data[3]];
        match &cmd {
            b"CK" => {
                if data.len() >= 8 {
                    Some(NetworkEndian::read_u32(&data[4..8]))
                } else {
                    None
                }
            }
            _ => {
                if data.len() >= 16 {
                    Some(NetworkEndian::read_u32(&data[12..16]))
                } else {
                    None
                }
            }
        }
    } else if data.len() >= 12 {
        // rtp header
        Some(NetworkEndian::read_u32(&data[8..12]))
    } else {
        None
    }
}

fn is_invitation(data: &[u8]) -> bool {
    is_session_message(data) && &data[2..4] == b"IN"
}

fn peek_token(data: &[u8]) -> Option<u32> {
    if data.len() >= 12 {
        Some(NetworkEndian::read_u32(&data[8..12]))
    } else {
        None
    }
}

#[cfg(test)]
mod test_rtp_listener {
    use super::*;
    use crate::common::apple_midi::{Invitation, SessionMessage};
    use crate::common::stream_time_stat::get_micro_time;
    use std::time::Duration;

    fn invite(token: u32, ssrc: u32, name: &str) -> Vec<u8> {
        SessionMessage::Invitation(Invitation {
            initiator_token: token,
            ssrc,
            name: String::from(name),
        })
        .to_bytes()
    }

    fn test_socket() -> UdpSocket {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.set_read_timeout(Some(Duration::new(2, 0))).unwrap();
        sock
    }

    #[test]
    fn binds_adjacent_ports() {
        let listener = RtpListener::build("room", 0).unwrap();
        assert!(listener.control_port() > 0);
    }

    #[test]
    fn full_accept_promotes_a_session() {
        // control IN, data IN, and we should be handed a connected session
        let mut listener = RtpListener::build("room", 0).unwrap();
        let port = listener.control_port();
        let remote_ctl = test_socket();
        let remote_data = test_socket();

        remote_ctl
            .send_to(&invite(0xCAFE, 0xAA55, "Alice"), ("127.0.0.1", port))
            .unwrap();
        let mut buf = [0u8; 256];
        // wait for the datagram to land before polling
        let now = get_micro_time();
        std::thread::sleep(Duration::from_millis(20));
        let events = listener.poll(now);
        assert!(events.is_empty());
        let (amt, _src) = remote_ctl.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..4], &[0xFF, 0xFF, b'O', b'K']);
        assert!(amt >= 16);

        remote_data
            .send_to(&invite(0xCAFE, 0xAA55, "Alice"), ("127.0.0.1", port + 1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let events = listener.poll(get_micro_time());
        assert_eq!(events.len(), 1);
        match &events[0] {
            ListenerEvent::NewSession { session, ssrc, .. } => {
                assert_eq!(*ssrc, 0xAA55);
                assert!(session.is_connected());
                assert_eq!(session.remote_name(), "Alice");
            }
            _ => panic!("expected a new session"),
        }
        let (_amt, _src) = remote_data.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..4], &[0xFF, 0xFF, b'O', b'K']);
    }

    #[test]
    fn duplicate_invitation_one_child() {
        // the same control IN twice must not spawn two pending sessions
        let mut listener = RtpListener::build("room", 0).unwrap();
        let port = listener.control_port();
        let remote_ctl = test_socket();
        let inv = invite(0x1234, 0xBEEF, "Bob");
        remote_ctl.send_to(&inv, ("127.0.0.1", port)).unwrap();
        remote_ctl.send_to(&inv, ("127.0.0.1", port)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let _events = listener.poll(get_micro_time());
        assert_eq!(listener.pending.len(), 1);
        // both invitations got an OK back
        let mut buf = [0u8; 256];
        let _res = remote_ctl.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..4], &[0xFF, 0xFF, b'O', b'K']);
        let _res = remote_ctl.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..4], &[0xFF, 0xFF, b'O', b'K']);
    }

    #[test]
    fn not_accepting_answers_no() {
        let mut listener = RtpListener::build("room", 0).unwrap();
        listener.set_accepting(false);
        let port = listener.control_port();
        let remote_ctl = test_socket();
        remote_ctl
            .send_to(&invite(0x77, 0x88, "Carol"), ("127.0.0.1", port))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let _events = listener.poll(get_micro_time());
        let mut buf = [0u8; 256];
        let _res = remote_ctl.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..4], &[0xFF, 0xFF, b'N', b'O']);
        assert_eq!(listener.pending.len(), 0);
    }

    #[test]
    fn known_child_gets_its_traffic() {
        let mut listener = RtpListener::build("room", 0).unwrap();
        listener.register_child(0xAA55, 7);
        let port = listener.control_port();
        let remote = test_socket();
        // a CK from the registered ssrc
        let ck = SessionMessage::ClockSync(crate::common::apple_midi::ClockSync {
            ssrc: 0xAA55,
            count: 0,
            t1: 42,
            t2: 0,
            t3: 0,
        })
        .to_bytes();
        remote.send_to(&ck, ("127.0.0.1", port + 1)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let events = listener.poll(get_micro_time());
        assert_eq!(events.len(), 1);
        match &events[0] {
            ListenerEvent::ForChild { child, channel, .. } => {
                assert_eq!(*child, 7);
                assert_eq!(*channel, SessionChannel::Data);
            }
            _ => panic!("expected child traffic"),
        }
    }
}
