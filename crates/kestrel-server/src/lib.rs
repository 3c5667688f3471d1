//! Kestrel Server
//!
//! The provider side of Kestrel: a dispatch table of async handlers, a TCP
//! server that decodes requests and runs them, and a [`Provider`] that keeps
//! the server's services registered while it runs.

pub mod dispatcher;
pub mod provider;
pub mod server;

pub use dispatcher::{Dispatcher, Handler, HandlerFuture, Params, Payload, ServiceFailure};
pub use provider::Provider;
pub use server::{shutdown_signal, RpcServer, ServerError};
