//! boxed error type used by everything that can fail.
//!
//! The daemon mixes io errors, json parse errors, and protocol errors in
//! the same call chains, so one boxed alias keeps the signatures readable.
pub type BoxError = std::boxed::Box<
    dyn std::error::Error // must implement Error to satisfy ?
        + std::marker::Send
        + std::marker::Sync,
>;
