//! glue between mdns service discovery and the router.
//!
//! The responder itself is a collaborator behind [`MdnsApi`]; this module
//! owns the chain of questions (PTR gives a service, SRV gives host and
//! port, A gives an address) and turns completed chains into "add a
//! client" actions for the daemon.  TTL zero means a service went away.
//! Re-announcements of services we already track are ignored, and two
//! services pointing at the same address and port count as one.
use std::collections::HashMap;
use std::net::IpAddr;

use crate::common::box_error::BoxError;

/// the service type every AppleMIDI box announces on
pub const SERVICE_TYPE: &str = "_apple-midi._udp.local";
/// re-announce period recommended by RFC 6762, in seconds
pub const TIMEOUT_REANNOUNCE: u32 = 75 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Ptr,
    Srv,
    A,
    Aaaa,
}

/// a service we publish (PTR + SRV pair under the hood)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub port: u16,
    pub ttl: u32,
}

/// answers the responder surfaces to us
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MdnsEvent {
    /// PTR answer: a service of our type exists
    ServiceFound { service_name: String },
    /// SRV answer: where the service lives (ttl 0 means removal)
    ServiceResolved {
        service_name: String,
        hostname: String,
        port: u16,
        ttl: u32,
    },
    /// A/AAAA answer for a hostname we asked about
    HostResolved { hostname: String, address: IpAddr },
    /// the responder noticed a service going away
    ServiceRemoved { service_name: String },
}

/// capability set of the mdns responder
pub trait MdnsApi {
    fn query(&mut self, name: &str, kind: RecordKind) -> Result<(), BoxError>;
    fn announce(&mut self, record: &ServiceRecord) -> Result<(), BoxError>;
    fn unannounce(&mut self, record: &ServiceRecord) -> Result<(), BoxError>;
    fn poll_event(&mut self) -> Option<MdnsEvent>;
    /// the host's primary name, asked of the responder rather than guessed
    fn local_hostname(&self) -> String;
}

/// what the daemon should do about the network neighborhood
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryAction {
    AddClient {
        name: String,
        address: String,
        port: u16,
    },
    RemoveClient {
        name: String,
    },
}

pub struct DiscoveryGlue {
    api: Box<dyn MdnsApi>,
    /// srv answers still waiting on an address
    pending: HashMap<String, (String, u16)>,
    /// service name -> (address, port) we created a client for
    known: HashMap<String, (String, u16)>,
}

impl DiscoveryGlue {
    /// start browsing for the service type right away
    pub fn build(mut api: Box<dyn MdnsApi>) -> DiscoveryGlue {
        if let Err(e) = api.query(SERVICE_TYPE, RecordKind::Ptr) {
            log::warn!("mdns browse failed: {}", e);
        }
        DiscoveryGlue {
            api,
            pending: HashMap::new(),
            known: HashMap::new(),
        }
    }

    /// publish one of our listeners
    pub fn announce(&mut self, name: &str, port: u16) -> () {
        let record = ServiceRecord {
            name: format!("{}.{}", name, SERVICE_TYPE),
            port,
            ttl: TIMEOUT_REANNOUNCE,
        };
        if let Err(e) = self.api.announce(&record) {
            log::warn!("could not announce '{}': {}", name, e);
        }
    }

    /// retract one of our listeners
    pub fn unannounce(&mut self, name: &str, port: u16) -> () {
        let record = ServiceRecord {
            name: format!("{}.{}", name, SERVICE_TYPE),
            port,
            ttl: 0,
        };
        if let Err(e) = self.api.unannounce(&record) {
            log::warn!("could not unannounce '{}': {}", name, e);
        }
    }

    pub fn local_hostname(&self) -> String {
        self.api.local_hostname()
    }

    /// a client the daemon removed by hand should not linger in our books
    pub fn forget(&mut self, name: &str) -> () {
        self.known.retain(|service, _| short_name(service) != name);
    }

    /// chew through responder events; returns what the daemon should do
    pub fn poll(&mut self) -> Vec<DiscoveryAction> {
        let mut actions: Vec<DiscoveryAction> = vec![];
        while let Some(event) = self.api.poll_event() {
            match event {
                MdnsEvent::ServiceFound { service_name } => {
                    // just ask; the SRV answer carries the details
                    if let Err(e) = self.api.query(&service_name, RecordKind::Srv) {
                        log::warn!("srv query failed: {}", e);
                    }
                }
                MdnsEvent::ServiceResolved {
                    service_name,
                    hostname,
                    port,
                    ttl,
                } => {
                    if ttl == 0 {
                        self.remove_service(&service_name, &mut actions);
                        continue;
                    }
                    if self.known.contains_key(&service_name) {
                        log::debug!("re-announce of {}, ignoring", service_name);
                        continue;
                    }
                    self.pending.insert(service_name, (hostname.clone(), port));
                    if let Err(e) = self.api.query(&hostname, RecordKind::A) {
                        log::warn!("address query failed: {}", e);
                    }
                }
                MdnsEvent::HostResolved { hostname, address } => {
                    let ready: Vec<String> = self
                        .pending
                        .iter()
                        .filter(|(_, (host, _))| *host == hostname)
                        .map(|(service, _)| service.clone())
                        .collect();
                    for service in ready {
                        let (_host, port) = self.pending.remove(&service).unwrap();
                        let addr_str = format!("{}", address);
                        // two names for the same endpoint are one peer
                        let duplicate = self
                            .known
                            .values()
                            .any(|(a, p)| *a == addr_str && *p == port);
                        if duplicate {
                            log::debug!(
                                "{} points at {}:{} which we already have",
                                service,
                                addr_str,
                                port
                            );
                            continue;
                        }
                        log::info!("found {} at {}:{}", service, addr_str, port);
                        self.known
                            .insert(service.clone(), (addr_str.clone(), port));
                        actions.push(DiscoveryAction::AddClient {
                            name: short_name(&service).to_string(),
                            address: addr_str,
                            port,
                        });
                    }
                }
                MdnsEvent::ServiceRemoved { service_name } => {
                    self.remove_service(&service_name, &mut actions);
                }
            }
        }
        actions
    }

    fn remove_service(&mut self, service_name: &str, actions: &mut Vec<DiscoveryAction>) -> () {
        self.pending.remove(service_name);
        if self.known.remove(service_name).is_some() {
            log::info!("{} is gone", service_name);
            actions.push(DiscoveryAction::RemoveClient {
                name: short_name(service_name).to_string(),
            });
        }
    }
}

/// responder stand-in for hosts without one.  Discovers nothing, announces
/// into the void; a platform backend replaces this at daemon setup.
pub struct NullMdns;

impl MdnsApi for NullMdns {
    fn query(&mut self, _name: &str, _kind: RecordKind) -> Result<(), BoxError> {
        Ok(())
    }
    fn announce(&mut self, record: &ServiceRecord) -> Result<(), BoxError> {
        log::debug!("no responder to announce {} on", record.name);
        Ok(())
    }
    fn unannounce(&mut self, _record: &ServiceRecord) -> Result<(), BoxError> {
        Ok(())
    }
    fn poll_event(&mut self) -> Option<MdnsEvent> {
        None
    }
    fn local_hostname(&self) -> String {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| String::from("localhost"));
        format!("{}.local", host.trim_end_matches(".local"))
    }
}

/// "Alice._apple-midi._udp.local" -> "Alice"
fn short_name(service_name: &str) -> &str {
    match service_name.split_once('.') {
        Some((first, _rest)) => first,
        None => service_name,
    }
}

#[cfg(test)]
mod test_discovery {
    use super::*;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;

    /// scripted responder
    struct FakeMdns {
        events: VecDeque<MdnsEvent>,
        queries: Vec<(String, RecordKind)>,
        announced: Vec<ServiceRecord>,
    }

    impl FakeMdns {
        fn boxed(events: Vec<MdnsEvent>) -> Box<FakeMdns> {
            Box::new(FakeMdns {
                events: events.into(),
                queries: vec![],
                announced: vec![],
            })
        }
    }

    impl MdnsApi for FakeMdns {
        fn query(&mut self, name: &str, kind: RecordKind) -> Result<(), BoxError> {
            self.queries.push((String::from(name), kind));
            Ok(())
        }
        fn announce(&mut self, record: &ServiceRecord) -> Result<(), BoxError> {
            self.announced.push(record.clone());
            Ok(())
        }
        fn unannounce(&mut self, record: &ServiceRecord) -> Result<(), BoxError> {
            self.announced.retain(|r| r.name != record.name);
            Ok(())
        }
        fn poll_event(&mut self) -> Option<MdnsEvent> {
            self.events.pop_front()
        }
        fn local_hostname(&self) -> String {
            String::from("testhost.local")
        }
    }

    fn resolved(service: &str, host: &str, port: u16, ttl: u32) -> MdnsEvent {
        MdnsEvent::ServiceResolved {
            service_name: String::from(service),
            hostname: String::from(host),
            port,
            ttl,
        }
    }

    #[test]
    fn full_chain_adds_a_client() {
        // PTR -> SRV -> A ends in an AddClient with the short name
        let api = FakeMdns::boxed(vec![
            MdnsEvent::ServiceFound {
                service_name: String::from("Alice._apple-midi._udp.local"),
            },
            resolved("Alice._apple-midi._udp.local", "alice.local", 5004, 4500),
            MdnsEvent::HostResolved {
                hostname: String::from("alice.local"),
                address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)),
            },
        ]);
        let mut glue = DiscoveryGlue::build(api);
        let actions = glue.poll();
        assert_eq!(
            actions,
            vec![DiscoveryAction::AddClient {
                name: String::from("Alice"),
                address: String::from("10.0.0.9"),
                port: 5004,
            }]
        );
    }

    #[test]
    fn reannounce_is_ignored() {
        let api = FakeMdns::boxed(vec![
            resolved("Alice._apple-midi._udp.local", "alice.local", 5004, 4500),
            MdnsEvent::HostResolved {
                hostname: String::from("alice.local"),
                address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)),
            },
            resolved("Alice._apple-midi._udp.local", "alice.local", 5004, 4500),
        ]);
        let mut glue = DiscoveryGlue::build(api);
        let actions = glue.poll();
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn same_endpoint_twice_is_one_peer() {
        // two service names, one address and port: second is a duplicate
        let api = FakeMdns::boxed(vec![
            resolved("Alice._apple-midi._udp.local", "alice.local", 5004, 4500),
            MdnsEvent::HostResolved {
                hostname: String::from("alice.local"),
                address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)),
            },
            resolved("AliceToo._apple-midi._udp.local", "alice.local", 5004, 4500),
            MdnsEvent::HostResolved {
                hostname: String::from("alice.local"),
                address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)),
            },
        ]);
        let mut glue = DiscoveryGlue::build(api);
        let actions = glue.poll();
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn ttl_zero_removes_the_client() {
        let api = FakeMdns::boxed(vec![
            resolved("Alice._apple-midi._udp.local", "alice.local", 5004, 4500),
            MdnsEvent::HostResolved {
                hostname: String::from("alice.local"),
                address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)),
            },
            resolved("Alice._apple-midi._udp.local", "alice.local", 5004, 0),
        ]);
        let mut glue = DiscoveryGlue::build(api);
        let actions = glue.poll();
        assert_eq!(actions.len(), 2);
        assert_eq!(
            actions[1],
            DiscoveryAction::RemoveClient {
                name: String::from("Alice")
            }
        );
    }

    #[test]
    fn local_hostname_comes_from_the_responder() {
        let api = FakeMdns::boxed(vec![]);
        let mut glue = DiscoveryGlue::build(api);
        glue.announce("room", 5004);
        assert_eq!(glue.local_hostname(), "testhost.local");
    }
}
