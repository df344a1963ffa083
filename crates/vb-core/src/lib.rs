//! # vb-core — shared types for verben
//!
//! Defines the trait-free vocabulary every other `vb-*` crate builds on:
//! connection identity, process roles, the plugin ABI, ring wire layout,
//! and the crate-wide error type. No I/O lives here.

pub mod conn_id;
pub mod error;
pub mod origin;
pub mod plugin;
pub mod ring_wire;
pub mod role;

pub use conn_id::ConnId;
pub use error::{Result, VbError};
pub use origin::{ConnBootId, OriginToken};
pub use plugin::{HandleResult, OptionalCallbacks, PluginDescriptor, SockInfo};
pub use ring_wire::RingMsgHeader;
pub use role::Role;
