//! Types shared between the preset daemon and its clients: the wire protocol,
//! configuration, platform paths and the published session snapshot.

pub mod config;
pub mod platform;
pub mod protocol;
pub mod state;
