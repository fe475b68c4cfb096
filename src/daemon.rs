//! the daemon: one cooperative loop that owns everything.
//!
//! Every tick services the control socket, the discovery glue, the
//! sequencer queue, and each peer's sockets and timers, then carries out
//! whatever deferred work those produced.  Nothing blocks and nothing runs
//! concurrently, so the router's invariants hold across the whole tick.
use std::collections::HashMap;
use std::thread::sleep;
use std::time::Duration;

use serde_json::json;

use crate::common::box_error::BoxError;
use crate::common::stream_time_stat::get_micro_time;
use crate::control_socket::ControlSocket;
use crate::discovery::{DiscoveryAction, DiscoveryGlue, MdnsApi};
use crate::peers::local_multi::LocalMultiListener;
use crate::peers::midi_peer::{PeerId, RouterEvent};
use crate::peers::net_client_peer::NetworkClientPeer;
use crate::peers::net_listener_peer::NetworkMultiListener;
use crate::peers::seq_peer::LocalSequencerPeer;
use crate::router::MidiRouter;
use crate::sequencer::{LocalPortId, SequencerApi};

/// everything main reads from flags and the settings file
#[derive(Debug, Clone)]
pub struct Settings {
    pub name: String,
    pub port: u16,
    pub control_path: String,
    pub connect_to: Vec<String>,
}

pub struct Daemon {
    router: MidiRouter,
    control: ControlSocket,
    discovery: DiscoveryGlue,
    seq: Box<dyn SequencerApi>,
    /// outbound clients by display name -> (source face, sink face, client)
    clients: HashMap<String, (PeerId, PeerId, PeerId)>,
    /// import listener children -> their dedicated (source, sink, port)
    import_ports: HashMap<PeerId, (PeerId, PeerId, LocalPortId)>,
    import_listener: PeerId,
    name: String,
}

impl Daemon {
    /// wire up the whole graph: import listener, shared Network port, any
    /// configured outbound connections, and the published service
    pub fn build(
        settings: &Settings,
        mut seq: Box<dyn SequencerApi>,
        mdns: Box<dyn MdnsApi>,
    ) -> Result<Daemon, BoxError> {
        let mut router = MidiRouter::new();
        let mut discovery = DiscoveryGlue::build(mdns);

        let control = ControlSocket::build(
            &settings.control_path,
            json!({
                "name": settings.name,
                "port": settings.port,
                "control": settings.control_path,
            }),
        )?;

        // inbound sessions land here; each one gets its own local port pair
        let import = NetworkMultiListener::build(&settings.name, settings.port, vec![], vec![])?;
        let import_port = import.control_port();
        let import_listener = router.add_peer(Box::new(import));
        discovery.announce(&settings.name, import_port);

        // the shared port local clients subscribe to for ad hoc exports
        let network_port = seq.create_port("Network")?;
        let sink = router.add_peer(Box::new(LocalSequencerPeer::sink("Network", network_port)));
        let lml = LocalMultiListener::build("Network", network_port, sink);
        router.add_peer(Box::new(lml));

        let mut daemon = Daemon {
            router,
            control,
            discovery,
            seq,
            clients: HashMap::new(),
            import_ports: HashMap::new(),
            import_listener,
            name: String::from(&settings.name),
        };

        // --connect-to entries: name, name:port, or name:host:port
        for entry in &settings.connect_to {
            let parts: Vec<&str> = entry.split(':').collect();
            let (name, host, port) = match parts.len() {
                1 => (parts[0], parts[0], "5004"),
                2 => (parts[0], parts[0], parts[1]),
                3 => (parts[0], parts[1], parts[2]),
                _ => {
                    log::error!("bad connect_to entry '{}' (name, name:port, or name:host:port)", entry);
                    continue;
                }
            };
            daemon.add_client(name, host, port);
        }

        Ok(daemon)
    }

    pub fn router(&self) -> &MidiRouter {
        &self.router
    }

    /// create the local port pair plus the outbound client for one remote
    /// and wire them into a bridge
    pub fn add_client(&mut self, name: &str, hostname: &str, port: &str) -> () {
        if self.clients.contains_key(name) {
            log::debug!("client '{}' already exists", name);
            return;
        }
        let seq_port = match self.seq.create_port(name) {
            Ok(p) => p,
            Err(e) => {
                log::error!("cannot create local port for '{}': {}", name, e);
                return;
            }
        };
        let source = self
            .router
            .add_peer(Box::new(LocalSequencerPeer::source(name, seq_port)));
        let sink = self
            .router
            .add_peer(Box::new(LocalSequencerPeer::sink(name, seq_port)));
        let client = self.router.add_peer(Box::new(NetworkClientPeer::build(
            name,
            vec![(String::from(hostname), String::from(port))],
        )));
        let mut events: Vec<RouterEvent> = vec![];
        // local playing goes out, the remote's playing comes back in
        if let Err(e) = self.router.connect_notified(source, client, &mut events) {
            log::error!("wiring '{}': {}", name, e);
        }
        if let Err(e) = self.router.connect_notified(client, sink, &mut events) {
            log::error!("wiring '{}': {}", name, e);
        }
        self.clients
            .insert(String::from(name), (source, sink, client));
        log::info!("client '{}' -> {}:{} ready", name, hostname, port);
        self.process_events(events);
    }

    /// tear down a bridge created by add_client
    pub fn remove_client(&mut self, name: &str) -> () {
        if let Some((source, sink, client)) = self.clients.remove(name) {
            let mut events: Vec<RouterEvent> = vec![];
            self.router.remove_peer(client, &mut events);
            self.router.remove_peer(source, &mut events);
            self.router.remove_peer(sink, &mut events);
            self.discovery.forget(name);
            self.process_events(events);
        }
    }

    /// one tick of the loop: service every input, then the deferred work
    pub fn run_once(&mut self) -> () {
        let now = get_micro_time();
        let mut events: Vec<RouterEvent> = vec![];

        self.control.poll(&mut self.router, &mut events);

        for action in self.discovery.poll() {
            match action {
                DiscoveryAction::AddClient {
                    name,
                    address,
                    port,
                } => {
                    self.add_client(&name, &address, &format!("{}", port));
                }
                DiscoveryAction::RemoveClient { name } => {
                    log::info!("'{}' left the network", name);
                    self.remove_client(&name);
                }
            }
        }

        while let Some(event) = self.seq.poll_event() {
            self.router
                .deliver_seq_event(event.port(), &event, &mut events);
        }

        self.router.poll_all(now, &mut events);
        self.process_events(events);
    }

    /// run forever.  The control socket is how you talk to it from here on.
    pub fn run(&mut self) -> Result<(), BoxError> {
        log::info!("rtp midi daemon '{}' running", self.name);
        loop {
            self.run_once();
            // roughly five thousand ticks a second keeps midi latency
            // negligible without pinning a core
            sleep(Duration::from_micros(200));
        }
    }

    /// carry out deferred work until none is left
    fn process_events(&mut self, mut events: Vec<RouterEvent>) -> () {
        while !events.is_empty() {
            let batch = std::mem::take(&mut events);
            for event in batch {
                match event {
                    RouterEvent::Midi { from, data } => {
                        self.router.send_midi_to(from, data, &mut events);
                    }
                    RouterEvent::Datagram { to, channel, bytes } => {
                        self.router
                            .deliver_datagram(to, channel, &bytes, &mut events);
                    }
                    RouterEvent::NewChild {
                        parent,
                        peer,
                        name,
                        targets_in,
                        targets_out,
                        key,
                    } => {
                        let id = self.router.add_peer(peer);
                        for t in targets_in {
                            if let Err(e) = self.router.connect_notified(id, t, &mut events) {
                                log::warn!("wiring child {} -> {}: {}", id, t, e);
                            }
                        }
                        for t in targets_out {
                            if let Err(e) = self.router.connect_notified(t, id, &mut events) {
                                log::warn!("wiring child {} <- {}: {}", id, t, e);
                            }
                        }
                        self.router.notify_child_added(parent, &key, id);
                        if parent == self.import_listener {
                            self.add_import_port(id, &name, &mut events);
                        }
                    }
                    RouterEvent::ChildClosed { parent, key } => {
                        self.router.notify_child_removed(parent, &key);
                    }
                    RouterEvent::RemovePeer { id } => {
                        self.router.remove_peer(id, &mut events);
                        if let Some((source, sink, _port)) = self.import_ports.remove(&id) {
                            self.router.remove_peer(source, &mut events);
                            self.router.remove_peer(sink, &mut events);
                        }
                        // a bridge that lost a piece is no longer a bridge
                        let router = &self.router;
                        let gone: Vec<String> = self
                            .clients
                            .iter()
                            .filter(|(_, (source, sink, client))| {
                                !(router.contains(*source)
                                    && router.contains(*sink)
                                    && router.contains(*client))
                            })
                            .map(|(name, _)| name.clone())
                            .collect();
                        for name in gone {
                            self.clients.remove(&name);
                            self.discovery.forget(&name);
                        }
                    }
                    RouterEvent::SeqSend { port, event } => {
                        if let Err(e) = self.seq.send_event(port, &event) {
                            log::warn!("sequencer send on port {}: {}", port, e);
                        }
                    }
                    RouterEvent::RemovePort { port } => {
                        if let Err(e) = self.seq.remove_port(port) {
                            log::debug!("sequencer remove port {}: {}", port, e);
                        }
                    }
                    RouterEvent::Announce { name, port } => {
                        self.discovery.announce(&name, port);
                    }
                    RouterEvent::Unannounce { name, port } => {
                        self.discovery.unannounce(&name, port);
                    }
                    RouterEvent::ConnectRequest {
                        name,
                        hostname,
                        port,
                    } => {
                        self.add_client(&name, &hostname, &port);
                    }
                }
            }
        }
    }

    /// a remote connected to the import listener gets its own local port
    /// named after it, wired both ways
    fn add_import_port(&mut self, child: PeerId, name: &str, events: &mut Vec<RouterEvent>) -> () {
        let port_name = if name.is_empty() { "rtp peer" } else { name };
        let seq_port = match self.seq.create_port(port_name) {
            Ok(p) => p,
            Err(e) => {
                log::error!("cannot create local port for '{}': {}", port_name, e);
                return;
            }
        };
        let source = self
            .router
            .add_peer(Box::new(LocalSequencerPeer::source(port_name, seq_port)));
        let sink = self
            .router
            .add_peer(Box::new(LocalSequencerPeer::sink(port_name, seq_port)));
        if let Err(e) = self.router.connect_notified(child, sink, events) {
            log::warn!("wiring import '{}': {}", port_name, e);
        }
        if let Err(e) = self.router.connect_notified(source, child, events) {
            log::warn!("wiring import '{}': {}", port_name, e);
        }
        self.import_ports.insert(child, (source, sink, seq_port));
        log::info!("'{}' is now local port {}", port_name, seq_port);
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.control.shutdown();
    }
}
