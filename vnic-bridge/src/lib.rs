//! Bridging daemon for the vnic virtual Ethernet adapter.
//!
//! Registers a bridging channel on one adapter instance and relays its
//! frames to and from a remote hub over TCP.

pub mod cli;
pub mod config;
pub mod runtime;
