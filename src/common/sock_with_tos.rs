//! UDP socket setup for the session channels.
//!
//! MIDI is latency sensitive, so the sockets ask for low delay TOS.  Bind
//! failures come back as errors because the caller may want to walk to the
//! next candidate port pair.
use socket2::{Domain, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use super::box_error::BoxError;

/// bind a non blocking UDP socket on the given port (0 for kernel assigned)
/// with TOS 0x10 (low delay)
pub fn new(port: u16) -> Result<UdpSocket, BoxError> {
    let raw_sock = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    raw_sock.set_tos(0x10)?;
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port);
    raw_sock.bind(&SockAddr::from(addr))?;
    let sock = UdpSocket::from(raw_sock);
    sock.set_nonblocking(true)?;
    Ok(sock)
}

/// bind the adjacent control/data pair a session needs.
///
/// Data port is always control + 1.  With port 0 the kernel picks the
/// control port and we bind its neighbor, retrying a few times in case the
/// neighbor is taken.
pub fn new_pair(port: u16) -> Result<(UdpSocket, UdpSocket), BoxError> {
    if port != 0 {
        let control = new(port)?;
        let data = new(port + 1)?;
        return Ok((control, data));
    }
    let mut last_err: Option<BoxError> = None;
    for _attempt in 0..10 {
        let control = new(0)?;
        let base = control.local_addr()?.port();
        match new(base + 1) {
            Ok(data) => return Ok((control, data)),
            Err(e) => {
                // neighbor port taken, roll new ones
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| "could not bind an adjacent port pair".into()))
}

#[cfg(test)]
mod test_sock_with_tos {
    use super::*;

    #[test]
    fn bind_ephemeral() {
        let sock = new(0).unwrap();
        assert!(sock.local_addr().unwrap().port() > 0);
    }
    #[test]
    fn bind_pair() {
        // data port must end up right after the control port
        let (control, data) = new_pair(0).unwrap();
        let cport = control.local_addr().unwrap().port();
        let dport = data.local_addr().unwrap().port();
        assert_eq!(dport, cport + 1);
    }
}
