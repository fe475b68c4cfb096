//! rtpmidi - bridge local MIDI ports to the network
//!
//! provides the pieces the rtpmidid daemon is built from: the RTP-MIDI /
//! AppleMIDI session machinery, the midi router that moves events between
//! local sequencer ports and remote peers, and the unix socket control
//! plane to poke at it all while it runs
pub mod common;
pub mod control_socket;
pub mod daemon;
pub mod discovery;
pub mod peers;
pub mod router;
pub mod sequencer;
pub mod session;
