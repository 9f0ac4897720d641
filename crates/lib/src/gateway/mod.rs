//! Gateway supervision and RPC bridge.
//!
//! The gateway is a separate process serving HTTP and WebSocket on one port. The supervisor
//! spawns it, waits for the port, completes the connect handshake and then multiplexes
//! request/result calls and pushed events over the one connection.

mod correlator;
mod events;
mod process;
mod protocol;
mod status;
mod supervisor;
mod transport;

pub use correlator::{Correlator, FrameSink};
pub use events::{BridgeEvent, ChatMessage, EventBus, SubscriptionId, Topic};
pub use process::{ExitInfo, GatewayProcess, LaunchSpec};
pub use protocol::{
    ConnectAuth, ConnectClient, ConnectParams, ErrorShape, EventFrame, Frame, HelloOk,
    HelloPolicy, RequestFrame, ResponseFrame, CONNECT_CHALLENGE_EVENT, CONNECT_METHOD,
    GENERIC_ERROR_CODE, HEALTH_METHOD, PROTOCOL_VERSION, SHUTDOWN_EVENT, TICK_EVENT,
};
pub use status::{GatewayState, GatewayStatus};
pub use supervisor::{EmbedInfo, HealthReport, Supervisor, PORT_ENV};
pub use transport::{gateway_ws_url, Connection, Inbound};
