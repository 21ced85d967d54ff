//! WebSocket bridge between browser clients and a streaming generative service.
//!
//! Each client connects to `/ws/{client_id}`, sends a config frame, and from
//! then on exchanges text, audio and image frames with one upstream session
//! that the gateway opens on its behalf.

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
#[doc(hidden)]
pub mod testing;
pub mod upstream;

pub use codec::{ClientInbound, NormalizedMessage};
pub use config::SessionConfig;
pub use coordinator::{DuplexCoordinator, SessionOutcome, SessionTiming};
pub use error::{ConnectError, DecodeError, GatewayError, ProtocolError, RecvError, SendError};
pub use protocol::{ClientEnvelope, ConfigPayload, ServerEnvelope};
pub use registry::{SessionHandle, SessionRegistry};
pub use server::GatewayServer;
pub use session::{Session, SessionStatus};
pub use upstream::{ensure_crypto_provider, UpstreamAdapter, UpstreamEndpoint};
