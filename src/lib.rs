#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod router;

pub use client::Client;
pub use codec::{FrameCodec, JsonCodec};
pub use config::{Config, ReconnectConfig};
pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus};
pub use error::{Error, Kind, TransportError};
pub use message::{Envelope, event_types};
pub use router::{DispatchRouter, Subscription};

pub type Result<T> = std::result::Result<T, Error>;
