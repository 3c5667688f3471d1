//! Kestrel Transport Layer
//!
//! This module provides the framed TCP transport and codecs for sending and
//! receiving RPC envelopes.
//!
//! # Architecture
//!
//! - **Transport**: TCP with keep-alive connections
//! - **Codec**: JSON or postcard, chosen per message by a one-byte tag
//! - **Wire Format**: `[4-byte length prefix as u32 big-endian] + [tag] + [body]`
//!
//! # Components
//!
//! - **[`Codec`]** / **[`JsonCodec`]** / **[`PostcardCodec`]**: Encode/decode envelopes
//! - **[`TcpTransportAsync`]**: Async TCP client transport
//! - **[`TcpServer`]**: Async TCP server with a per-connection request loop
//!
//! # Message Size Limits
//!
//! Frames larger than [`MAX_MESSAGE_SIZE`] (100 MB) are rejected on both
//! the sending and the receiving side.

pub mod codec;
pub mod tcp;
pub mod tcp_server;

pub use codec::{Codec, JsonCodec, PostcardCodec, MAX_MESSAGE_SIZE};
pub use tcp::{receive_message, send_message, try_receive_message, TcpTransportAsync};
pub use tcp_server::TcpServer;

#[cfg(test)]
mod tests;
