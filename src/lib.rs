//! Emberlink - MQTT v3.1.1/v5.0 broker core
//!
//! A tokio-based MQTT broker with a pluggable hook chain for auth,
//! persistence and observability. The broker core covers the connection
//! state machine, publish/subscribe routing, the QoS 0/1/2 inflight
//! protocol and the periodic housekeeping loop.

pub mod broker;
pub mod codec;
pub mod config;
pub mod hooks;
pub mod listener;
pub mod protocol;
pub mod session;
pub mod system;
pub mod topic;

pub use broker::{Broker, Capabilities, Compatibilities, Options};
pub use config::Config;
pub use hooks::{Hook, HookChain, HookEvent};
pub use listener::{Listener, TcpListener};
pub use protocol::{ProtocolVersion, QoS, ReasonCode};
pub use session::{Client, ClientRegistry};
pub use topic::TopicsIndex;
