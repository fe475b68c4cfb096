//! These modules are shared wire and plumbing pieces used all over the daemon.
pub mod apple_midi;
pub mod box_error;
pub mod config;
pub mod midi_event;
pub mod midi_stream;
pub mod rtp_packet;
pub mod sock_with_tos;
pub mod stream_time_stat;
