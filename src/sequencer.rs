//! the seam to the host MIDI sequencer.
//!
//! The daemon does not talk ALSA or CoreMIDI directly; it talks to this
//! trait.  A platform backend implements it and the rest of the code never
//! knows the difference.  The loopback implementation here is what the
//! tests (and a headless run) use: events pushed in one side come out the
//! poll side, in order.
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc;

use simple_error::bail;

use crate::common::box_error::BoxError;
use crate::common::midi_event::MidiEvent;

pub type LocalPortId = u32;

/// notifications the sequencer surfaces to the daemon loop
#[derive(Debug, Clone, PartialEq)]
pub enum SeqEvent {
    /// another local client subscribed to one of our ports
    Subscribed { port: LocalPortId, name: String },
    /// a local client went away
    Unsubscribed { port: LocalPortId, name: String },
    /// a local client played something into one of our ports
    Midi { port: LocalPortId, event: MidiEvent },
}

impl SeqEvent {
    /// which of our ports the notification is about
    pub fn port(&self) -> LocalPortId {
        match self {
            SeqEvent::Subscribed { port, .. } => *port,
            SeqEvent::Unsubscribed { port, .. } => *port,
            SeqEvent::Midi { port, .. } => *port,
        }
    }
}

/// capability set of the host sequencer
pub trait SequencerApi {
    /// create a local port other clients can see and connect to
    fn create_port(&mut self, name: &str) -> Result<LocalPortId, BoxError>;
    /// drop a port (subscribers get disconnected by the host)
    fn remove_port(&mut self, port: LocalPortId) -> Result<(), BoxError>;
    /// push one event out a port to its subscribers
    fn send_event(&mut self, port: LocalPortId, event: &MidiEvent) -> Result<(), BoxError>;
    /// pull the next pending notification, if any
    fn poll_event(&mut self) -> Option<SeqEvent>;
}

/// in-memory sequencer used for tests and sequencer-less operation.
///
/// Whatever gets sent out a port is captured so a test can assert on it,
/// and tests can inject events/subscriptions from the "local client" side.
pub struct LoopbackSequencer {
    next_port: LocalPortId,
    ports: HashMap<LocalPortId, String>,
    queue: VecDeque<SeqEvent>,
    sent: Vec<(LocalPortId, MidiEvent)>,
    mirror_tx: Option<mpsc::Sender<(LocalPortId, MidiEvent)>>,
    inject_rx: Option<mpsc::Receiver<SeqEvent>>,
}

impl LoopbackSequencer {
    pub fn build() -> LoopbackSequencer {
        LoopbackSequencer {
            next_port: 0,
            ports: HashMap::new(),
            queue: VecDeque::new(),
            sent: vec![],
            mirror_tx: None,
            inject_rx: None,
        }
    }
    /// hooked up variant: outbound events are mirrored to `tx` and events
    /// sent on `rx` behave like local client activity.  Lets a test (or an
    /// adapter thread) stand in for the local clients.
    pub fn with_channels(
        tx: mpsc::Sender<(LocalPortId, MidiEvent)>,
        rx: mpsc::Receiver<SeqEvent>,
    ) -> LoopbackSequencer {
        let mut seq = LoopbackSequencer::build();
        seq.mirror_tx = Some(tx);
        seq.inject_rx = Some(rx);
        seq
    }
    /// test hook: pretend a local client did something
    pub fn inject(&mut self, event: SeqEvent) -> () {
        self.queue.push_back(event);
    }
    /// test hook: what went out the ports
    pub fn sent_events(&self) -> &Vec<(LocalPortId, MidiEvent)> {
        &self.sent
    }
    pub fn port_names(&self) -> Vec<String> {
        self.ports.values().cloned().collect()
    }
}

impl SequencerApi for LoopbackSequencer {
    fn create_port(&mut self, name: &str) -> Result<LocalPortId, BoxError> {
        let port = self.next_port;
        self.next_port += 1;
        self.ports.insert(port, String::from(name));
        log::debug!("created local port {} '{}'", port, name);
        Ok(port)
    }
    fn remove_port(&mut self, port: LocalPortId) -> Result<(), BoxError> {
        match self.ports.remove(&port) {
            Some(name) => {
                log::debug!("removed local port {} '{}'", port, name);
                Ok(())
            }
            None => bail!("no local port {}", port),
        }
    }
    fn send_event(&mut self, port: LocalPortId, event: &MidiEvent) -> Result<(), BoxError> {
        if !self.ports.contains_key(&port) {
            bail!("send on missing local port {}", port);
        }
        self.sent.push((port, *event));
        if let Some(tx) = &self.mirror_tx {
            let _res = tx.send((port, *event));
        }
        Ok(())
    }
    fn poll_event(&mut self) -> Option<SeqEvent> {
        if let Some(rx) = &self.inject_rx {
            if let Ok(event) = rx.try_recv() {
                return Some(event);
            }
        }
        self.queue.pop_front()
    }
}
