//! anchor-rpc — request/reply between peers that survives a failover.
//!
//! Peers expose methods through a [`HandlerRegistry`]. Methods tagged
//! exclusive only run on the active instance of a sticky-active group;
//! every other instance answers [`RpcError::NotActive`]. The
//! [`ResilientCaller`] retries exactly that class of failure with jittered
//! backoff until the new leader answers.

pub mod caller;
pub mod error;
pub mod handlers;
pub mod local;
pub mod transport;

pub use caller::ResilientCaller;
pub use error::{RpcError, RpcResult};
pub use handlers::{Handler, HandlerKind, HandlerRegistry, handler};
pub use local::LocalTransport;
pub use transport::{CallTarget, RpcEndpoint, SharedTransport, Transport};
