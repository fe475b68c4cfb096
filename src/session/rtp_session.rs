//! state machine for one AppleMIDI session with a remote endpoint.
//!
//! This thing is pure protocol: it gets handed the bytes that arrived on
//! the control or data socket and answers with the bytes to send back,
//! plus any decoded MIDI.  Sockets and timers live with whoever owns the
//! session (client connector or listener), so everything in here can be
//! tested with literal packets.
use rand::random;
use std::fmt;
use std::time::Instant;

use crate::common::apple_midi::{ClockSync, Invitation, SessionMessage};
use crate::common::midi_event::MidiEvent;
use crate::common::midi_stream;
use crate::common::rtp_packet::{RtpPacket, RTP_HEADER_SIZE};
use crate::common::stream_time_stat::{get_micro_time, StreamTimeStat};

/// exchanges we run back to back on a fresh connection before dropping to
/// the slow cadence
pub const CK_FAST_EXCHANGES: u32 = 6;
/// slow cadence between clock syncs once the session is stable
pub const CK_INTERVAL_USEC: u128 = 10_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    NotConnected,
    ControlPending,
    ControlConnected,
    DataPending,
    CkPending,
    Connected,
    Disconnected(DisconnectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Rejected,
    ConnectTimeout,
    CkTimeout,
    PeerDisconnected,
    LocalDisconnect,
    BadPacket,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::NotConnected => "not_connected",
            SessionStatus::ControlPending => "control_pending",
            SessionStatus::ControlConnected => "control_connected",
            SessionStatus::DataPending => "data_pending",
            SessionStatus::CkPending => "ck_pending",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected(DisconnectReason::Rejected) => "disconnected[rejected]",
            SessionStatus::Disconnected(DisconnectReason::ConnectTimeout) => {
                "disconnected[timeout]"
            }
            SessionStatus::Disconnected(DisconnectReason::CkTimeout) => "disconnected[ck_timeout]",
            SessionStatus::Disconnected(DisconnectReason::PeerDisconnected) => {
                "disconnected[peer_disconnected]"
            }
            SessionStatus::Disconnected(DisconnectReason::LocalDisconnect) => {
                "disconnected[local_disconnect]"
            }
            SessionStatus::Disconnected(DisconnectReason::BadPacket) => "disconnected[bad_packet]",
        }
    }
}

/// which of the two adjacent sockets a datagram came in on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionChannel {
    Control,
    Data,
}

/// what the state machine wants done after chewing on a datagram
#[derive(Debug)]
pub enum SessionOut {
    /// send these bytes on the control socket
    Control(Vec<u8>),
    /// send these bytes on the data socket
    Data(Vec<u8>),
    /// decoded MIDI that should go to the router
    Midi(Vec<MidiEvent>),
}

#[derive(Debug)]
pub struct RtpSession {
    local_name: String,
    local_ssrc: u32,
    initiator_token: u32,
    remote_ssrc: Option<u32>,
    remote_name: String,
    status: SessionStatus,
    sequence_nr: u16,
    remote_sequence_nr: Option<u16>,
    clock_origin: Instant,
    latency_stat: StreamTimeStat,
    ck_exchanges: u32,
    last_sync_time: u128,
    malformed_count: u32,
}

impl RtpSession {
    pub fn build(local_name: &str) -> RtpSession {
        RtpSession {
            local_name: String::from(local_name),
            local_ssrc: random::<u32>(),
            initiator_token: 0,
            remote_ssrc: None,
            remote_name: String::new(),
            status: SessionStatus::NotConnected,
            sequence_nr: random::<u16>(),
            remote_sequence_nr: None,
            clock_origin: Instant::now(),
            latency_stat: StreamTimeStat::new(10),
            ck_exchanges: 0,
            last_sync_time: 0,
            malformed_count: 0,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }
    pub fn local_ssrc(&self) -> u32 {
        self.local_ssrc
    }
    pub fn remote_ssrc(&self) -> Option<u32> {
        self.remote_ssrc
    }
    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }
    pub fn local_name(&self) -> &str {
        &self.local_name
    }
    /// smoothed round trip / 2 in milliseconds
    pub fn latency_ms(&self) -> f64 {
        self.latency_stat.get_mean()
    }
    pub fn ck_exchanges(&self) -> u32 {
        self.ck_exchanges
    }
    /// at least six exchanges makes the link trustworthy
    pub fn is_stable(&self) -> bool {
        self.ck_exchanges >= CK_FAST_EXCHANGES
    }
    pub fn last_sync_time(&self) -> u128 {
        self.last_sync_time
    }
    pub fn malformed_count(&self) -> u32 {
        self.malformed_count
    }
    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }

    /// session clock in 100 microsecond ticks
    fn now_ticks(&self) -> u64 {
        (self.clock_origin.elapsed().as_micros() / 100) as u64
    }

    /// back to square one so the owner can retry the handshake
    pub fn reset(&mut self) -> () {
        self.status = SessionStatus::NotConnected;
        self.initiator_token = 0;
        self.remote_ssrc = None;
        self.remote_name.clear();
        self.remote_sequence_nr = None;
        self.latency_stat.clear();
        self.ck_exchanges = 0;
        self.last_sync_time = 0;
    }

    /// start the handshake as initiator.  Returns the IN for the control
    /// socket.
    pub fn initiate(&mut self) -> Vec<u8> {
        self.initiator_token = random::<u32>();
        self.status = SessionStatus::ControlPending;
        SessionMessage::Invitation(self.local_invitation()).to_bytes()
    }

    /// goodbye for both sockets, status goes terminal
    pub fn disconnect(&mut self) -> Vec<u8> {
        self.status = SessionStatus::Disconnected(DisconnectReason::LocalDisconnect);
        SessionMessage::Goodbye {
            initiator_token: self.initiator_token,
            ssrc: self.local_ssrc,
        }
        .to_bytes()
    }

    /// owner noticed a deadline blow by (connect or clock sync)
    pub fn mark_timed_out(&mut self, reason: DisconnectReason) -> () {
        log::info!(
            "session with {} timed out ({:?})",
            self.describe_remote(),
            reason
        );
        self.status = SessionStatus::Disconnected(reason);
    }

    /// fresh CK0 to kick off an exchange (owner sends this on a timer too)
    pub fn make_clock_sync(&mut self) -> Vec<u8> {
        SessionMessage::ClockSync(ClockSync {
            ssrc: self.local_ssrc,
            count: 0,
            t1: self.now_ticks(),
            t2: 0,
            t3: 0,
        })
        .to_bytes()
    }

    /// frame outbound midi commands as an RTP data packet
    pub fn make_midi_packet(&mut self, events: &[MidiEvent]) -> Vec<u8> {
        let mut packet = RtpPacket::build();
        self.sequence_nr = self.sequence_nr.wrapping_add(1);
        packet.set_sequence_num(self.sequence_nr);
        packet.set_timestamp(self.now_ticks() as u32);
        packet.set_ssrc(self.local_ssrc);
        // a payload that does not fit in the buffer would be kilobytes of
        // midi in one tick; drop it loudly rather than truncate
        if let Err(e) = packet.set_payload(&midi_stream::encode_payload(events)) {
            log::error!("outbound midi dropped: {}", e);
        }
        packet.get_send_buffer().to_vec()
    }

    /// feed one received datagram through the state machine
    pub fn advance(&mut self, channel: SessionChannel, data: &[u8]) -> Vec<SessionOut> {
        if crate::common::apple_midi::is_session_message(data) {
            match SessionMessage::parse(data) {
                Ok(msg) => self.handle_session_message(channel, msg),
                Err(e) => {
                    self.malformed_count += 1;
                    log::warn!("bad session message from {}: {}", self.describe_remote(), e);
                    vec![]
                }
            }
        } else {
            self.handle_rtp_data(channel, data)
        }
    }

    fn handle_session_message(
        &mut self,
        channel: SessionChannel,
        msg: SessionMessage,
    ) -> Vec<SessionOut> {
        match msg {
            SessionMessage::Invitation(inv) => self.handle_invitation(channel, inv),
            SessionMessage::Accepted(inv) => self.handle_accepted(channel, inv),
            SessionMessage::Rejected(_inv) => {
                log::info!("invitation rejected by {}", self.describe_remote());
                self.status = SessionStatus::Disconnected(DisconnectReason::Rejected);
                vec![]
            }
            SessionMessage::ClockSync(ck) => self.handle_clock_sync(channel, ck),
            SessionMessage::Goodbye { ssrc, .. } => {
                if let Some(remote) = self.remote_ssrc {
                    if remote != ssrc {
                        log::warn!("goodbye with foreign ssrc {:08X}, ignoring", ssrc);
                        return vec![];
                    }
                }
                log::info!("goodbye from {}", self.describe_remote());
                self.status = SessionStatus::Disconnected(DisconnectReason::PeerDisconnected);
                vec![]
            }
        }
    }

    /// responder side of the handshake
    fn handle_invitation(&mut self, channel: SessionChannel, inv: Invitation) -> Vec<SessionOut> {
        match (self.status, channel) {
            (SessionStatus::NotConnected, SessionChannel::Control) => {
                self.initiator_token = inv.initiator_token;
                self.remote_ssrc = Some(inv.ssrc);
                self.remote_name = inv.name;
                self.status = SessionStatus::ControlConnected;
                log::debug!(
                    "control invitation from {} (ssrc {:08X})",
                    self.remote_name,
                    inv.ssrc
                );
                vec![SessionOut::Control(self.accept_bytes())]
            }
            (SessionStatus::ControlConnected, SessionChannel::Data) => {
                if inv.initiator_token != self.initiator_token
                    || Some(inv.ssrc) != self.remote_ssrc
                {
                    log::warn!("data invitation for a different session, rejecting");
                    return vec![SessionOut::Data(self.reject_bytes(inv.initiator_token))];
                }
                self.status = SessionStatus::Connected;
                log::info!("session established with {}", self.remote_name);
                vec![SessionOut::Data(self.accept_bytes())]
            }
            // a re-invitation for a session we already have gets the same
            // answer again, the first OK probably got lost
            (_, channel) => {
                if Some(inv.ssrc) == self.remote_ssrc
                    && inv.initiator_token == self.initiator_token
                {
                    log::debug!("re-invitation from {}, repeating OK", self.remote_name);
                    let bytes = self.accept_bytes();
                    return match channel {
                        SessionChannel::Control => vec![SessionOut::Control(bytes)],
                        SessionChannel::Data => vec![SessionOut::Data(bytes)],
                    };
                }
                log::warn!(
                    "invitation in state {:?} on {:?}, rejecting",
                    self.status,
                    channel
                );
                let bytes = self.reject_bytes(inv.initiator_token);
                match channel {
                    SessionChannel::Control => vec![SessionOut::Control(bytes)],
                    SessionChannel::Data => vec![SessionOut::Data(bytes)],
                }
            }
        }
    }

    /// initiator side: the remote said OK
    fn handle_accepted(&mut self, channel: SessionChannel, inv: Invitation) -> Vec<SessionOut> {
        match (self.status, channel) {
            (SessionStatus::ControlPending, SessionChannel::Control) => {
                if inv.initiator_token != self.initiator_token {
                    log::warn!("OK with the wrong token, rejecting session");
                    self.status = SessionStatus::Disconnected(DisconnectReason::Rejected);
                    return vec![];
                }
                self.remote_ssrc = Some(inv.ssrc);
                self.remote_name = inv.name;
                self.status = SessionStatus::DataPending;
                log::debug!("control accepted by {}, inviting on data", self.remote_name);
                vec![SessionOut::Data(
                    SessionMessage::Invitation(self.local_invitation()).to_bytes(),
                )]
            }
            (SessionStatus::DataPending, SessionChannel::Data) => {
                if inv.initiator_token != self.initiator_token {
                    log::warn!("data OK with the wrong token, rejecting session");
                    self.status = SessionStatus::Disconnected(DisconnectReason::Rejected);
                    return vec![];
                }
                self.status = SessionStatus::CkPending;
                log::debug!("data accepted by {}, starting clock sync", self.remote_name);
                vec![SessionOut::Data(self.make_clock_sync())]
            }
            _ => {
                // late or duplicate OK, nothing to do
                log::debug!("stray OK in state {:?}", self.status);
                vec![]
            }
        }
    }

    fn handle_clock_sync(&mut self, channel: SessionChannel, ck: ClockSync) -> Vec<SessionOut> {
        if channel != SessionChannel::Data {
            log::warn!("clock sync on the control channel, ignoring");
            return vec![];
        }
        match ck.count {
            0 => {
                // responder: echo T1, stamp T2
                let reply = SessionMessage::ClockSync(ClockSync {
                    ssrc: self.local_ssrc,
                    count: 1,
                    t1: ck.t1,
                    t2: self.now_ticks(),
                    t3: 0,
                })
                .to_bytes();
                vec![SessionOut::Data(reply)]
            }
            1 => {
                // initiator: close the exchange with T3 and note the trip time
                let t3 = self.now_ticks();
                self.finish_exchange(ck.t1, t3);
                let mut out = vec![SessionOut::Data(
                    SessionMessage::ClockSync(ClockSync {
                        ssrc: self.local_ssrc,
                        count: 2,
                        t1: ck.t1,
                        t2: ck.t2,
                        t3,
                    })
                    .to_bytes(),
                )];
                if self.ck_exchanges < CK_FAST_EXCHANGES {
                    // young connection, keep the exchanges coming
                    out.push(SessionOut::Data(self.make_clock_sync()));
                }
                out
            }
            2 => {
                // responder sees the closing leg
                self.finish_exchange(ck.t1, ck.t3);
                vec![]
            }
            _ => {
                log::warn!("clock sync with count {} from {}", ck.count, self.describe_remote());
                vec![]
            }
        }
    }

    fn finish_exchange(&mut self, t1: u64, t3: u64) -> () {
        let latency_ticks = t3.saturating_sub(t1) / 2;
        // ticks are 100us, so /10 gives milliseconds
        self.latency_stat.add_sample(latency_ticks as f64 / 10.0);
        self.ck_exchanges += 1;
        self.last_sync_time = get_micro_time();
        if self.status == SessionStatus::CkPending {
            self.status = SessionStatus::Connected;
            log::info!(
                "session with {} connected, latency {:.2} ms",
                self.remote_name,
                self.latency_ms()
            );
        }
    }

    fn handle_rtp_data(&mut self, channel: SessionChannel, data: &[u8]) -> Vec<SessionOut> {
        if channel != SessionChannel::Data {
            self.malformed_count += 1;
            log::warn!("rtp data on the control channel from {}", self.describe_remote());
            return vec![];
        }
        let mut packet = RtpPacket::build();
        if data.len() > packet.get_buffer().len() {
            self.malformed_count += 1;
            log::warn!("oversize datagram of {} bytes dropped", data.len());
            return vec![];
        }
        packet.get_buffer()[..data.len()].copy_from_slice(data);
        if packet.set_nbytes(data.len()).is_err() {
            self.malformed_count += 1;
            log::warn!("datagram is not rtp midi, dropped");
            return vec![];
        }
        if let Some(remote) = self.remote_ssrc {
            if packet.get_ssrc() != remote {
                log::warn!(
                    "rtp packet with ssrc {:08X}, session is {:08X}, dropped",
                    packet.get_ssrc(),
                    remote
                );
                return vec![];
            }
        }
        // watch the sequence numbers so lost packets at least get logged.
        // No journal, so there is nothing to recover.
        let seq = packet.get_sequence_num();
        if let Some(last) = self.remote_sequence_nr {
            if seq != last.wrapping_add(1) {
                log::warn!(
                    "lost midi packets from {}: seq {} after {}",
                    self.describe_remote(),
                    seq,
                    last
                );
            }
        }
        self.remote_sequence_nr = Some(seq);
        if data.len() == RTP_HEADER_SIZE {
            // bare keepalive header, no commands
            return vec![];
        }
        match midi_stream::decode_payload(packet.get_payload()) {
            Ok(events) => {
                if events.is_empty() {
                    vec![]
                } else {
                    vec![SessionOut::Midi(events)]
                }
            }
            Err(e) => {
                self.malformed_count += 1;
                log::warn!("{} from {}", e, self.describe_remote());
                vec![]
            }
        }
    }

    fn local_invitation(&self) -> Invitation {
        Invitation {
            initiator_token: self.initiator_token,
            ssrc: self.local_ssrc,
            name: self.local_name.clone(),
        }
    }

    fn accept_bytes(&self) -> Vec<u8> {
        SessionMessage::Accepted(self.local_invitation()).to_bytes()
    }

    /// a NO echoing the inviter's token
    fn reject_bytes(&self, token: u32) -> Vec<u8> {
        SessionMessage::Rejected(Invitation {
            initiator_token: token,
            ssrc: self.local_ssrc,
            name: self.local_name.clone(),
        })
        .to_bytes()
    }

    fn describe_remote(&self) -> &str {
        if self.remote_name.is_empty() {
            "(unknown)"
        } else {
            &self.remote_name
        }
    }

    /// structured report for the control plane
    pub fn status_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": self.status.as_str(),
            "local_ssrc": format!("{:08X}", self.local_ssrc),
            "remote_ssrc": self.remote_ssrc.map(|s| format!("{:08X}", s)),
            "remote_name": self.remote_name,
            "latency_ms": self.latency_ms(),
            "ck_exchanges": self.ck_exchanges,
            "malformed": self.malformed_count,
        })
    }
}

impl fmt::Display for RtpSession {
    // This trait requires `fmt` with this exact signature.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ {} <-> {} status: {} latency: {:.2}ms }}",
            self.local_name,
            self.describe_remote(),
            self.status.as_str(),
            self.latency_ms()
        )
    }
}

#[cfg(test)]
mod test_rtp_session {
    use super::*;
    use crate::common::apple_midi::PROTOCOL_VERSION;
    use byteorder::{ByteOrder, NetworkEndian};

    fn invitation_packet(cmd: &[u8; 2], token: u32, ssrc: u32, name: &str) -> Vec<u8> {
        let mut pkt = vec![0xFF, 0xFF, cmd[0], cmd[1]];
        pkt.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        pkt.extend_from_slice(&token.to_be_bytes());
        pkt.extend_from_slice(&ssrc.to_be_bytes());
        pkt.extend_from_slice(name.as_bytes());
        pkt.push(0);
        pkt
    }

    #[test]
    fn responder_handshake() {
        // IN on control then IN on data gets two OKs and a connected session
        let mut session = RtpSession::build("local test");
        let out = session.advance(
            SessionChannel::Control,
            &invitation_packet(b"IN", 0xCAFEBABE, 0xDEADBEEF, "Alice"),
        );
        assert_eq!(out.len(), 1);
        match &out[0] {
            SessionOut::Control(bytes) => {
                assert_eq!(&bytes[2..4], b"OK");
                // the OK echoes the initiator token
                assert_eq!(NetworkEndian::read_u32(&bytes[8..12]), 0xCAFEBABE);
            }
            _ => panic!("expected control bytes"),
        }
        assert_eq!(session.status(), SessionStatus::ControlConnected);
        assert_eq!(session.remote_name(), "Alice");

        let out = session.advance(
            SessionChannel::Data,
            &invitation_packet(b"IN", 0xCAFEBABE, 0xDEADBEEF, "Alice"),
        );
        match &out[0] {
            SessionOut::Data(bytes) => assert_eq!(&bytes[2..4], b"OK"),
            _ => panic!("expected data bytes"),
        }
        assert_eq!(session.status(), SessionStatus::Connected);
    }

    #[test]
    fn re_invitation_is_idempotent() {
        // the same IN twice answers OK twice without a second session
        let mut session = RtpSession::build("local test");
        let inv = invitation_packet(b"IN", 0x1111, 0x2222, "Bob");
        let _res = session.advance(SessionChannel::Control, &inv);
        let ssrc_before = session.remote_ssrc();
        let out = session.advance(SessionChannel::Control, &inv);
        assert_eq!(out.len(), 1);
        assert_eq!(session.remote_ssrc(), ssrc_before);
    }

    #[test]
    fn initiator_handshake() {
        // walk the whole connect sequence through to connected
        let mut session = RtpSession::build("initiator");
        let in_bytes = session.initiate();
        assert_eq!(&in_bytes[2..4], b"IN");
        assert_eq!(session.status(), SessionStatus::ControlPending);
        let token = NetworkEndian::read_u32(&in_bytes[8..12]);

        // remote accepts on control -> we invite on data
        let out = session.advance(
            SessionChannel::Control,
            &invitation_packet(b"OK", token, 0x5555AAAA, "Remote"),
        );
        match &out[0] {
            SessionOut::Data(bytes) => assert_eq!(&bytes[2..4], b"IN"),
            _ => panic!("expected data invitation"),
        }
        assert_eq!(session.status(), SessionStatus::DataPending);
        assert_eq!(session.remote_ssrc(), Some(0x5555AAAA));

        // remote accepts on data -> first clock sync goes out
        let out = session.advance(
            SessionChannel::Data,
            &invitation_packet(b"OK", token, 0x5555AAAA, "Remote"),
        );
        match &out[0] {
            SessionOut::Data(bytes) => assert_eq!(&bytes[2..4], b"CK"),
            _ => panic!("expected clock sync"),
        }
        assert_eq!(session.status(), SessionStatus::CkPending);

        // remote answers the sync -> connected with a sane latency
        let reply = SessionMessage::ClockSync(ClockSync {
            ssrc: 0x5555AAAA,
            count: 1,
            t1: 0,
            t2: 5,
            t3: 0,
        })
        .to_bytes();
        let out = session.advance(SessionChannel::Data, &reply);
        assert_eq!(session.status(), SessionStatus::Connected);
        assert!(session.latency_ms() >= 0.0);
        // closing CK2 plus the next fast exchange CK0
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn rejection() {
        let mut session = RtpSession::build("initiator");
        let in_bytes = session.initiate();
        let token = NetworkEndian::read_u32(&in_bytes[8..12]);
        let _res = session.advance(
            SessionChannel::Control,
            &invitation_packet(b"NO", token, 0x99, "Remote"),
        );
        assert_eq!(
            session.status(),
            SessionStatus::Disconnected(DisconnectReason::Rejected)
        );
    }

    #[test]
    fn clock_sync_responder_leg() {
        // CK0 with T1=1000 must come back as count 1 with T1 kept and T3 zero
        let mut session = RtpSession::build("responder");
        let ck0 = SessionMessage::ClockSync(ClockSync {
            ssrc: 0x44,
            count: 0,
            t1: 1000,
            t2: 0,
            t3: 0,
        })
        .to_bytes();
        let out = session.advance(SessionChannel::Data, &ck0);
        match &out[0] {
            SessionOut::Data(bytes) => {
                assert_eq!(bytes[8], 1);
                assert_eq!(NetworkEndian::read_u64(&bytes[12..20]), 1000);
                assert_eq!(NetworkEndian::read_u64(&bytes[28..36]), 0);
            }
            _ => panic!("expected data bytes"),
        }
    }

    #[test]
    fn clock_sync_final_leg_sets_latency() {
        // count 2 with T1/T3 a known distance apart: latency is half of it
        let mut session = RtpSession::build("responder");
        let ck2 = SessionMessage::ClockSync(ClockSync {
            ssrc: 0x44,
            count: 2,
            t1: 1000,
            t2: 1500,
            t3: 3000,
        })
        .to_bytes();
        let _res = session.advance(SessionChannel::Data, &ck2);
        assert_eq!(session.ck_exchanges(), 1);
        // one sample of (3000-1000)/2 ticks = 100ms in a window of 10
        assert!(session.latency_ms() > 0.0);
        assert!(session.last_sync_time() > 0);
    }

    #[test]
    fn six_exchanges_make_it_stable() {
        let mut session = RtpSession::build("responder");
        for i in 0..6u64 {
            let ck2 = SessionMessage::ClockSync(ClockSync {
                ssrc: 0x44,
                count: 2,
                t1: 1000 * i,
                t2: 0,
                t3: 1000 * i + 20,
            })
            .to_bytes();
            let _res = session.advance(SessionChannel::Data, &ck2);
        }
        assert!(session.is_stable());
        assert!(session.latency_ms() >= 0.0);
    }

    #[test]
    fn goodbye_disconnects() {
        let mut session = RtpSession::build("local test");
        let inv = invitation_packet(b"IN", 0x1111, 0x2222, "Bob");
        let _res = session.advance(SessionChannel::Control, &inv);
        let by = SessionMessage::Goodbye {
            initiator_token: 0x1111,
            ssrc: 0x2222,
        }
        .to_bytes();
        let _res = session.advance(SessionChannel::Control, &by);
        assert_eq!(
            session.status(),
            SessionStatus::Disconnected(DisconnectReason::PeerDisconnected)
        );
    }

    #[test]
    fn midi_in_after_handshake() {
        // a data packet with the remote's ssrc decodes to events
        let mut session = RtpSession::build("local test");
        let _res = session.advance(
            SessionChannel::Control,
            &invitation_packet(b"IN", 0x1111, 0x2222, "Bob"),
        );
        let _res = session.advance(
            SessionChannel::Data,
            &invitation_packet(b"IN", 0x1111, 0x2222, "Bob"),
        );
        let mut packet = RtpPacket::build();
        packet.set_sequence_num(100);
        packet.set_ssrc(0x2222);
        packet
            .set_payload(&midi_stream::encode_payload(&[MidiEvent::NoteOn {
                channel: 0,
                note: 60,
                velocity: 64,
            }]))
            .unwrap();
        let data = packet.get_send_buffer().to_vec();
        let out = session.advance(SessionChannel::Data, &data);
        match &out[0] {
            SessionOut::Midi(events) => {
                assert_eq!(
                    events[0],
                    MidiEvent::NoteOn {
                        channel: 0,
                        note: 60,
                        velocity: 64
                    }
                );
            }
            _ => panic!("expected midi"),
        }
    }

    #[test]
    fn foreign_ssrc_is_dropped() {
        let mut session = RtpSession::build("local test");
        let _res = session.advance(
            SessionChannel::Control,
            &invitation_packet(b"IN", 0x1111, 0x2222, "Bob"),
        );
        let mut packet = RtpPacket::build();
        packet.set_ssrc(0x9999);
        packet.set_payload(&[0x23, 0x90, 0x3C, 0x40]).unwrap();
        let data = packet.get_send_buffer().to_vec();
        let out = session.advance(SessionChannel::Data, &data);
        assert!(out.is_empty());
    }

    #[test]
    fn outbound_midi_counts_sequence() {
        let mut session = RtpSession::build("local test");
        let first = session.make_midi_packet(&[MidiEvent::NoteOn {
            channel: 0,
            note: 60,
            velocity: 64,
        }]);
        let second = session.make_midi_packet(&[MidiEvent::NoteOff {
            channel: 0,
            note: 60,
            velocity: 0,
        }]);
        let seq1 = NetworkEndian::read_u16(&first[2..4]);
        let seq2 = NetworkEndian::read_u16(&second[2..4]);
        assert_eq!(seq2, seq1.wrapping_add(1));
    }
}
