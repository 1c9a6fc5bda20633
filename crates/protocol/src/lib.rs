//! Wire types for the Chrome DevTools Protocol.
//!
//! This crate contains the serde-serializable types used for communication
//! with a Chromium-family browser over the DevTools protocol. These types
//! represent the "protocol layer" - the shapes of data as they appear on
//! the wire.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! - **Pure data**: No behavior beyond serialization/deserialization
//! - **1:1 with protocol**: Match the DevTools protocol JSON schema
//! - **Partial**: Only the domains and fields the client consumes are
//!   modeled; unknown fields are ignored on deserialization
//!
//! Higher-level ergonomic APIs are built on top of these types in `cdp-rs`.

pub mod device_access;
pub mod fetch;
pub mod message;
pub mod network;
pub mod page;
pub mod runtime;
pub mod target;

pub use message::*;
