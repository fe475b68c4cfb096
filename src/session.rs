//! things used to run AppleMIDI sessions (the state machine plus the
//! outbound connector and inbound acceptor that own the sockets)
pub mod rtp_client;
pub mod rtp_listener;
pub mod rtp_session;
