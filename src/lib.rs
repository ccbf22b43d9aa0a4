pub mod client;
pub mod completion;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod handshake;
pub mod memory;
pub mod server;
pub mod wire;
pub mod write_notify;

pub use completion::{WcStatus, WorkCompletion, WrTag};
pub use connection::{ConnectParams, Connection, CycleEvent};
pub use endpoint::{Endpoint, EndpointState};
pub use error::{RdmaError, Result};
pub use event::{CmEventKind, EventChannel};
pub use memory::{AccessRights, MemoryRegion, ProtectionDomain};
pub use wire::RemoteBufferDescriptor;
