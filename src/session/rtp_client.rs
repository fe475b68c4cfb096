//! outbound session connector.
//!
//! Owns the socket pair and the timers for one remote endpoint and drives
//! the [`RtpSession`] handshake.  Gets a list of candidate addresses and
//! walks down it when a connect attempt times out, the way you want when
//! mDNS hands you three addresses for the same piano.
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use crate::common::box_error::BoxError;
use crate::common::midi_event::MidiEvent;
use crate::common::sock_with_tos;
use crate::common::stream_time_stat::MicroTimer;
use crate::session::rtp_session::{
    DisconnectReason, RtpSession, SessionChannel, SessionOut, SessionStatus, CK_INTERVAL_USEC,
};
use simple_error::bail;

/// give up on one address after this long without progress
pub const CONNECT_TIMEOUT_USEC: u128 = 5_000_000;
/// total attempts before reporting the connect as failed
pub const CONNECT_ATTEMPTS: u32 = 3;
/// three silent sync periods and the peer is presumed dead
pub const CK_MISSED_USEC: u128 = 3 * CK_INTERVAL_USEC;

/// things the owner needs to react to after a poll
#[derive(Debug)]
pub enum ClientEvent {
    /// decoded midi from the remote side
    Midi(Vec<MidiEvent>),
    /// session ended, reason says why
    Disconnected(DisconnectReason),
    /// every candidate address was tried and none answered
    ConnectFailed,
}

pub struct RtpClient {
    session: RtpSession,
    endpoints: Vec<(String, String)>,
    next_endpoint: usize,
    attempts: u32,
    control_sock: Option<UdpSocket>,
    data_sock: Option<UdpSocket>,
    remote_control: Option<SocketAddr>,
    remote_data: Option<SocketAddr>,
    connect_timer: MicroTimer,
    ck_timer: MicroTimer,
}

impl RtpClient {
    /// build with a local name and (hostname, port) candidates.  Nothing is
    /// resolved or sent until connect is called.
    pub fn build(local_name: &str, endpoints: Vec<(String, String)>, now: u128) -> RtpClient {
        RtpClient {
            session: RtpSession::build(local_name),
            endpoints,
            next_endpoint: 0,
            attempts: 0,
            control_sock: None,
            data_sock: None,
            remote_control: None,
            remote_data: None,
            connect_timer: MicroTimer::new(now, CONNECT_TIMEOUT_USEC),
            ck_timer: MicroTimer::new(now, CK_INTERVAL_USEC),
        }
    }

    pub fn session(&self) -> &RtpSession {
        &self.session
    }
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// start the handshake against the next candidate address
    pub fn connect_to_next(&mut self, now: u128) -> Result<(), BoxError> {
        if self.endpoints.is_empty() {
            bail!("no endpoints to connect to");
        }
        let (host, port) = self.endpoints[self.next_endpoint % self.endpoints.len()].clone();
        self.next_endpoint += 1;
        self.attempts += 1;
        let port_num: u16 = port.parse()?;
        // lazy resolve, hostnames straight from discovery or the cli
        let mut resolved = format!("{}:{}", host, port_num).to_socket_addrs()?;
        let control_addr = match resolved.next() {
            Some(addr) => addr,
            None => bail!("could not resolve {}", host),
        };
        let mut data_addr = control_addr.clone();
        data_addr.set_port(control_addr.port() + 1);

        let (control, data) = sock_with_tos::new_pair(0)?;
        log::info!(
            "connecting to {} at {} (attempt {})",
            host,
            control_addr,
            self.attempts
        );
        self.session.reset();
        let invite = self.session.initiate();
        control.send_to(&invite, control_addr)?;
        self.control_sock = Some(control);
        self.data_sock = Some(data);
        self.remote_control = Some(control_addr);
        self.remote_data = Some(data_addr);
        self.connect_timer.reset(now);
        self.ck_timer.reset(now);
        Ok(())
    }

    /// start over at the top of the list with a fresh attempt budget
    pub fn reconnect(&mut self, now: u128) -> Result<(), BoxError> {
        self.disconnect();
        self.attempts = 0;
        self.next_endpoint = 0;
        self.connect_to_next(now)
    }

    /// drop the session and sockets, telling the remote side first
    pub fn disconnect(&mut self) -> () {
        if self.session.status() == SessionStatus::Connected
            || self.session.status() == SessionStatus::CkPending
        {
            let bye = self.session.disconnect();
            if let (Some(sock), Some(addr)) = (&self.control_sock, self.remote_control) {
                let _res = sock.send_to(&bye, addr);
            }
            if let (Some(sock), Some(addr)) = (&self.data_sock, self.remote_data) {
                let _res = sock.send_to(&bye, addr);
            }
        }
        self.control_sock = None;
        self.data_sock = None;
        self.remote_control = None;
        self.remote_data = None;
    }

    /// push midi out to the remote end
    pub fn send_midi(&mut self, events: &[MidiEvent]) -> () {
        if !self.is_connected() {
            log::debug!("midi while not connected, dropped");
            return;
        }
        let packet = self.session.make_midi_packet(events);
        if let (Some(sock), Some(addr)) = (&self.data_sock, self.remote_data) {
            if let Err(e) = sock.send_to(&packet, addr) {
                log::warn!("could not send midi: {}", e);
            }
        }
    }

    /// service sockets and timers.  Call this every tick.
    pub fn poll(&mut self, now: u128) -> Vec<ClientEvent> {
        let mut events: Vec<ClientEvent> = vec![];
        if self.control_sock.is_none() {
            return events;
        }
        self.pump_socket(SessionChannel::Control, &mut events);
        self.pump_socket(SessionChannel::Data, &mut events);

        match self.session.status() {
            SessionStatus::Connected => {
                self.connect_timer.reset(now);
                self.attempts = 0;
                if self.ck_timer.expired(now) {
                    self.ck_timer.reset(now);
                    let ck = self.session.make_clock_sync();
                    if let (Some(sock), Some(addr)) = (&self.data_sock, self.remote_data) {
                        let _res = sock.send_to(&ck, addr);
                    }
                }
                if self.session.last_sync_time() > 0
                    && now.saturating_sub(self.session.last_sync_time()) > CK_MISSED_USEC
                {
                    log::warn!(
                        "no clock sync answer from {} in 30s, dropping session",
                        self.session.remote_name()
                    );
                    let bye = self.session.disconnect();
                    if let (Some(sock), Some(addr)) = (&self.control_sock, self.remote_control) {
                        let _res = sock.send_to(&bye, addr);
                    }
                    self.session.mark_timed_out(DisconnectReason::CkTimeout);
                    self.control_sock = None;
                    self.data_sock = None;
                    events.push(ClientEvent::Disconnected(DisconnectReason::CkTimeout));
                }
            }
            SessionStatus::Disconnected(reason) => {
                self.control_sock = None;
                self.data_sock = None;
                events.push(ClientEvent::Disconnected(reason));
            }
            _ => {
                // still shaking hands
                if self.connect_timer.expired(now) {
                    if self.attempts >= CONNECT_ATTEMPTS {
                        log::warn!("connect failed after {} attempts", self.attempts);
                        self.session.mark_timed_out(DisconnectReason::ConnectTimeout);
                        self.control_sock = None;
                        self.data_sock = None;
                        events.push(ClientEvent::ConnectFailed);
                    } else {
                        log::info!("connect attempt timed out, trying next address");
                        if let Err(e) = self.connect_to_next(now) {
                            log::warn!("connect retry failed: {}", e);
                            self.session.mark_timed_out(DisconnectReason::ConnectTimeout);
                            events.push(ClientEvent::ConnectFailed);
                        }
                    }
                }
            }
        }
        events
    }

    fn pump_socket(&mut self, channel: SessionChannel, events: &mut Vec<ClientEvent>) -> () {
        let mut buf = [0u8; 1500];
        loop {
            let recv = {
                let sock = match channel {
                    SessionChannel::Control => self.control_sock.as_ref(),
                    SessionChannel::Data => self.data_sock.as_ref(),
                };
                match sock {
                    Some(s) => s.recv_from(&mut buf),
                    None => return,
                }
            };
            match recv {
                Ok((amt, _src)) => {
                    let outs = self.session.advance(channel, &buf[..amt]);
                    self.apply_session_outs(outs, events);
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => return,
                    _ => {
                        log::warn!("socket error on {:?}: {}", channel, e);
                        return;
                    }
                },
            }
        }
    }

    fn apply_session_outs(&mut self, outs: Vec<SessionOut>, events: &mut Vec<ClientEvent>) -> () {
        for out in outs {
            match out {
                SessionOut::Control(bytes) => {
                    if let (Some(sock), Some(addr)) = (&self.control_sock, self.remote_control) {
                        let _res = sock.send_to(&bytes, addr);
                    }
                }
                SessionOut::Data(bytes) => {
                    if let (Some(sock), Some(addr)) = (&self.data_sock, self.remote_data) {
                        let _res = sock.send_to(&bytes, addr);
                    }
                }
                SessionOut::Midi(midi) => {
                    events.push(ClientEvent::Midi(midi));
                }
            }
        }
    }

    pub fn status_json(&self) -> serde_json::Value {
        let mut report = self.session.status_json();
        report["endpoints"] = serde_json::json!(self
            .endpoints
            .iter()
            .map(|(h, p)| format!("{}:{}", h, p))
            .collect::<Vec<String>>());
        report
    }
}
