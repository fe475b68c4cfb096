//! json-rpc control plane on a unix socket.
//!
//! One request per line, one response per line, nothing stays buffered.
//! `status` and the `router.*` verbs talk to the router; `<id>.<verb>`
//! goes to that peer's own command handler; `connect` asks the daemon to
//! set up a whole outbound client.  A stale socket file from a previous
//! run gets replaced at startup.
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};

use serde_json::{json, Value};
use socket2::{Domain, SockAddr, Socket, Type};

use crate::common::box_error::BoxError;
use crate::peers::midi_peer::RouterEvent;
use crate::router::MidiRouter;

const MAX_LINE: usize = 1024;
const MSG_CLOSE: &str = "{\"event\": \"close\", \"detail\": \"Shutdown\", \"code\": 0}\n";
const MSG_TOO_LONG: &str = "{\"event\": \"close\", \"detail\": \"Message too long\", \"code\": 1}\n";

struct ControlClient {
    stream: UnixStream,
    buf: Vec<u8>,
}

pub struct ControlSocket {
    listener: UnixListener,
    clients: Vec<ControlClient>,
    path: String,
    settings: Value,
}

impl ControlSocket {
    /// bind the socket, world writable, replacing any stale one
    pub fn build(path: &str, settings: Value) -> Result<ControlSocket, BoxError> {
        if std::fs::remove_file(path).is_ok() {
            log::info!("removed old control socket, creating new one");
        }
        let raw = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        raw.bind(&SockAddr::unix(path)?)?;
        raw.listen(20)?;
        let listener = UnixListener::from(raw);
        listener.set_nonblocking(true)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))?;
        log::info!("control socket ready at {}", path);
        Ok(ControlSocket {
            listener,
            clients: vec![],
            path: String::from(path),
            settings,
        })
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// accept new clients and answer whatever lines have arrived
    pub fn poll(&mut self, router: &mut MidiRouter, out: &mut Vec<RouterEvent>) -> () {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    if stream.set_nonblocking(true).is_ok() {
                        self.clients.push(ControlClient {
                            stream,
                            buf: vec![],
                        });
                    }
                }
                Err(e) => {
                    if e.kind() != ErrorKind::WouldBlock {
                        log::warn!("control accept failed: {}", e);
                    }
                    break;
                }
            }
        }

        let mut dead: Vec<usize> = vec![];
        for idx in 0..self.clients.len() {
            let mut chunk = [0u8; MAX_LINE];
            loop {
                let read = self.clients[idx].stream.read(&mut chunk);
                match read {
                    Ok(0) => {
                        dead.push(idx);
                        break;
                    }
                    Ok(n) => {
                        self.clients[idx].buf.extend_from_slice(&chunk[..n]);
                        // lines get answered as they complete
                        while let Some(pos) =
                            self.clients[idx].buf.iter().position(|b| *b == b'\n')
                        {
                            let line: Vec<u8> =
                                self.clients[idx].buf.drain(..=pos).collect();
                            let line = String::from_utf8_lossy(&line[..line.len() - 1])
                                .trim()
                                .to_string();
                            if line.is_empty() {
                                continue;
                            }
                            let mut reply = handle_request(router, &line, &self.settings, out);
                            reply.push('\n');
                            if write_reply(&mut self.clients[idx].stream, &reply).is_err() {
                                dead.push(idx);
                            }
                        }
                        if self.clients[idx].buf.len() > MAX_LINE {
                            let _res =
                                write_reply(&mut self.clients[idx].stream, MSG_TOO_LONG);
                            dead.push(idx);
                            break;
                        }
                    }
                    Err(e) => {
                        if e.kind() != ErrorKind::WouldBlock {
                            dead.push(idx);
                        }
                        break;
                    }
                }
            }
        }
        // drop in reverse so the indexes stay right
        dead.sort();
        dead.dedup();
        for idx in dead.into_iter().rev() {
            self.clients.remove(idx);
        }
    }

    /// say goodbye to every client (daemon shutdown)
    pub fn shutdown(&mut self) -> () {
        for client in &mut self.clients {
            let _res = write_reply(&mut client.stream, MSG_CLOSE);
        }
        self.clients.clear();
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        self.shutdown();
        let _res = std::fs::remove_file(&self.path);
    }
}

fn write_reply(stream: &mut UnixStream, reply: &str) -> std::io::Result<()> {
    stream.write_all(reply.as_bytes())?;
    stream.flush()
}

/// one request line in, one response object out
fn handle_request(
    router: &mut MidiRouter,
    line: &str,
    settings: &Value,
    out: &mut Vec<RouterEvent>,
) -> String {
    let request: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            return json!({"id": null, "error": format!("parse error: {}", e)}).to_string();
        }
    };
    let id = request["id"].clone();
    let method = match request["method"].as_str() {
        Some(m) => m,
        None => {
            return json!({"id": id, "error": "no method"}).to_string();
        }
    };
    let params = &request["params"];
    let result = dispatch(router, method, params, settings, out);
    match result {
        Ok(value) => json!({"id": id, "result": value}).to_string(),
        Err(e) => json!({"id": id, "error": e.to_string()}).to_string(),
    }
}

fn dispatch(
    router: &mut MidiRouter,
    method: &str,
    params: &Value,
    settings: &Value,
    out: &mut Vec<RouterEvent>,
) -> Result<Value, BoxError> {
    match method {
        "status" => Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "settings": settings,
            "router": router.status(),
        })),
        "router.remove" => {
            let peer_id = match params[0].as_u64() {
                Some(id) => id as u32,
                None => simple_error::bail!("need [peer_id]"),
            };
            // routed through the daemon so dependent peers get cleaned up
            out.push(RouterEvent::RemovePeer { id: peer_id });
            Ok(json!("ok"))
        }
        "router.connect" => {
            let (from, to) = route_params(params)?;
            router.connect_notified(from, to, out)?;
            Ok(json!("ok"))
        }
        "router.disconnect" => {
            let (from, to) = route_params(params)?;
            router.disconnect(from, to, out);
            Ok(json!("ok"))
        }
        "connect" => {
            let (name, hostname, port) = connect_params(params)?;
            out.push(RouterEvent::ConnectRequest {
                name,
                hostname,
                port,
            });
            Ok(json!("ok"))
        }
        "help" => Ok(json!([
            {"name": "status", "description": "Daemon, router and peer status"},
            {"name": "router.remove", "description": "Remove a peer: [peer_id]"},
            {"name": "router.connect", "description": "Add a route: {from, to}"},
            {"name": "router.disconnect", "description": "Remove a route: {from, to}"},
            {"name": "connect", "description": "Connect out: [hostname] | [hostname, port] | [name, hostname, port] | {name, hostname, port}"},
            {"name": "help", "description": "This list"},
            {"name": "<peer_id>.<verb>", "description": "Peer specific command"},
        ])),
        _ => {
            // "<number>.<verb>" goes to that peer
            if let Some((id_part, verb)) = method.split_once('.') {
                if let Ok(peer_id) = id_part.parse::<u32>() {
                    return router.peer_command(peer_id, verb, params, out);
                }
            }
            simple_error::bail!("Unknown method '{}'", method)
        }
    }
}

fn route_params(params: &Value) -> Result<(u32, u32), BoxError> {
    let from = params["from"].as_u64();
    let to = params["to"].as_u64();
    match (from, to) {
        (Some(from), Some(to)) => Ok((from as u32, to as u32)),
        _ => simple_error::bail!("need {{from, to}}"),
    }
}

fn connect_params(params: &Value) -> Result<(String, String, String), BoxError> {
    fn as_string(v: &Value) -> Option<String> {
        match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
    if let Some(list) = params.as_array() {
        let strings: Vec<String> = list.iter().filter_map(as_string).collect();
        if strings.len() != list.len() {
            simple_error::bail!("connect params must be strings or numbers");
        }
        return match strings.len() {
            1 => Ok((strings[0].clone(), strings[0].clone(), String::from("5004"))),
            2 => Ok((strings[0].clone(), strings[0].clone(), strings[1].clone())),
            3 => Ok((strings[0].clone(), strings[1].clone(), strings[2].clone())),
            _ => simple_error::bail!(
                "need 1 param (hostname), 2 params (hostname, port), 3 params (name, hostname, port) or a dict {{name, hostname, port}}"
            ),
        };
    }
    if params.is_object() {
        let name = as_string(&params["name"]);
        let hostname = as_string(&params["hostname"]);
        let port = as_string(&params["port"]);
        if let (Some(name), Some(hostname), Some(port)) = (name, hostname, port) {
            return Ok((name, hostname, port));
        }
    }
    simple_error::bail!(
        "need 1 param (hostname), 2 params (hostname, port), 3 params (name, hostname, port) or a dict {{name, hostname, port}}"
    )
}

#[cfg(test)]
mod test_control_socket {
    use super::*;
    use crate::peers::midi_peer::{MidiData, MidiPeer, PeerId};
    use std::io::BufRead;
    use std::io::BufReader;
    use std::time::Duration;

    struct DummyPeer;
    impl MidiPeer for DummyPeer {
        fn kind(&self) -> &'static str {
            "dummy"
        }
        fn send_midi(&mut self, _from: PeerId, _data: &MidiData, _out: &mut Vec<RouterEvent>) {}
        fn status(&self) -> Value {
            json!({})
        }
    }

    fn sock_path(tag: &str) -> String {
        let path = std::env::temp_dir().join(format!("rtpmidi_ctl_{}_{}.sock", tag, std::process::id()));
        String::from(path.to_str().unwrap())
    }

    fn roundtrip(
        control: &mut ControlSocket,
        router: &mut MidiRouter,
        path: &str,
        request: &str,
    ) -> Value {
        let mut client = UnixStream::connect(path).unwrap();
        client
            .set_read_timeout(Some(Duration::new(2, 0)))
            .unwrap();
        client.write_all(request.as_bytes()).unwrap();
        client.write_all(b"\n").unwrap();
        // a couple of polls so accept and read both happen
        let mut out = vec![];
        std::thread::sleep(Duration::from_millis(20));
        control.poll(router, &mut out);
        std::thread::sleep(Duration::from_millis(20));
        control.poll(router, &mut out);
        let mut reader = BufReader::new(client);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[test]
    fn connect_two_peers() {
        // S6: a good route says ok, a missing peer says UnknownPeer
        let path = sock_path("connect");
        let mut control = ControlSocket::build(&path, json!({})).unwrap();
        let mut router = MidiRouter::new();
        let a = router.add_peer(Box::new(DummyPeer));
        let b = router.add_peer(Box::new(DummyPeer));

        let reply = roundtrip(
            &mut control,
            &mut router,
            &path,
            &format!(
                "{{\"method\":\"router.connect\",\"params\":{{\"from\":{},\"to\":{}}},\"id\":7}}",
                a, b
            ),
        );
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["result"], "ok");

        let reply = roundtrip(
            &mut control,
            &mut router,
            &path,
            "{\"method\":\"router.connect\",\"params\":{\"from\":1,\"to\":55},\"id\":8}",
        );
        assert_eq!(reply["id"], 8);
        assert_eq!(reply["error"], "UnknownPeer");
    }

    #[test]
    fn status_has_version_and_router() {
        let path = sock_path("status");
        let mut control = ControlSocket::build(&path, json!({"name": "test"})).unwrap();
        let mut router = MidiRouter::new();
        let reply = roundtrip(
            &mut control,
            &mut router,
            &path,
            "{\"method\":\"status\",\"id\":1}",
        );
        assert!(reply["result"]["version"].is_string());
        assert_eq!(reply["result"]["settings"]["name"], "test");
        assert!(reply["result"]["router"]["peers"].is_array());
    }

    #[test]
    fn connect_method_queues_a_request() {
        let path = sock_path("dial");
        let mut control = ControlSocket::build(&path, json!({})).unwrap();
        let mut router = MidiRouter::new();

        let mut client = UnixStream::connect(&path).unwrap();
        client
            .set_read_timeout(Some(Duration::new(2, 0)))
            .unwrap();
        client
            .write_all(b"{\"method\":\"connect\",\"params\":[\"piano.local\",\"5008\"],\"id\":2}\n")
            .unwrap();
        let mut out = vec![];
        std::thread::sleep(Duration::from_millis(20));
        control.poll(&mut router, &mut out);
        std::thread::sleep(Duration::from_millis(20));
        control.poll(&mut router, &mut out);
        assert_eq!(out.len(), 1);
        match &out[0] {
            RouterEvent::ConnectRequest {
                name,
                hostname,
                port,
            } => {
                assert_eq!(name, "piano.local");
                assert_eq!(hostname, "piano.local");
                assert_eq!(port, "5008");
            }
            _ => panic!("expected a connect request"),
        }
    }

    #[test]
    fn unknown_method_is_reported() {
        let path = sock_path("unknown");
        let mut control = ControlSocket::build(&path, json!({})).unwrap();
        let mut router = MidiRouter::new();
        let reply = roundtrip(
            &mut control,
            &mut router,
            &path,
            "{\"method\":\"frobnicate\",\"id\":3}",
        );
        assert_eq!(reply["error"], "Unknown method 'frobnicate'");
    }

    #[test]
    fn oversize_line_closes_the_client() {
        let path = sock_path("toolong");
        let mut control = ControlSocket::build(&path, json!({})).unwrap();
        let mut router = MidiRouter::new();
        let mut client = UnixStream::connect(&path).unwrap();
        client
            .set_read_timeout(Some(Duration::new(2, 0)))
            .unwrap();
        let big = vec![b'x'; 2000];
        client.write_all(&big).unwrap();
        let mut out = vec![];
        std::thread::sleep(Duration::from_millis(20));
        control.poll(&mut router, &mut out);
        std::thread::sleep(Duration::from_millis(20));
        control.poll(&mut router, &mut out);
        let mut reader = BufReader::new(client);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let reply: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(reply["event"], "close");
        assert_eq!(reply["code"], 1);
        assert_eq!(control.client_count(), 0);
    }

    #[test]
    fn connect_param_shapes() {
        // every accepted spelling of the connect params
        let (n, h, p) = connect_params(&json!(["host"])).unwrap();
        assert_eq!((n.as_str(), h.as_str(), p.as_str()), ("host", "host", "5004"));
        let (n, h, p) = connect_params(&json!(["host", 5008])).unwrap();
        assert_eq!((n.as_str(), h.as_str(), p.as_str()), ("host", "host", "5008"));
        let (n, h, p) = connect_params(&json!(["nice name", "host", "5008"])).unwrap();
        assert_eq!((n.as_str(), h.as_str(), p.as_str()), ("nice name", "host", "5008"));
        let (n, h, p) =
            connect_params(&json!({"name": "x", "hostname": "y", "port": 5004})).unwrap();
        assert_eq!((n.as_str(), h.as_str(), p.as_str()), ("x", "y", "5004"));
        assert!(connect_params(&json!([])).is_err());
        assert!(connect_params(&json!("plain")).is_err());
    }
}
