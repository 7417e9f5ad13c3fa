//! wagate — a WhatsApp session gateway.
//!
//! Bridges one stateful chat protocol session to local consumers: realtime
//! connectivity events, inbound message delivery, and outbound sends, with
//! write-through persistence that survives disconnects, QR re-pairing, and
//! restarts.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod logging;

pub mod events;
pub mod protocol;
pub mod store;

pub mod gateway;

pub use gateway::{Gateway, GatewayError};
