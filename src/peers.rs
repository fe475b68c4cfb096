//! the peer kinds the router can own, and the trait they share
pub mod local_multi;
pub mod midi_peer;
pub mod net_client_peer;
pub mod net_listener_peer;
pub mod net_server_peer;
pub mod seq_peer;
