//! Request/response control protocol between clients and the manager,
//! plus a separate one-way notification stream.

pub mod client;
pub mod framing;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod transport;

pub use client::{EventStream, ManagerClient};
pub use protocol::{EventFrame, Request, Response};
pub use server::{ControlHandler, serve};
pub use transport::IpcListener;
