//! Multiplexes many client sessions onto one shared, single-threaded engine,
//! and lets server-side code call methods on a remote viewer and await the
//! replies.

/// Engine loop and the handle sessions use to reach it.
pub mod bridge;

/// Async reverse-RPC client with request/response correlation.
pub mod client;

/// Command line and environment configuration.
pub mod config;

/// In-process engine used by the binary.
pub mod engine;

/// Wire envelopes and identifiers.
pub mod message;

/// Session id to delivery callback mapping.
pub mod registry;

/// WebSocket endpoint.
pub mod server;

/// Per-client registration with the engine.
pub mod session;

/// Logging infrastructure.
pub mod tracing;

pub use bridge::{
    BridgeError, BridgeHandle, BridgeThread, Engine, EngineResponse, LoopBridge, LoopMode,
};
pub use client::{connect_local, AsyncClient, ClientError, PeerSink, ResponseHandle};
pub use engine::MemoryEngine;
pub use message::{Envelope, EnvelopeError, MessageId, MethodCall, Payload, SessionId};
pub use registry::{DeliveryCallback, DeliveryError, RegistryError, SessionRegistry};
pub use session::Session;

pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;
