//! Shared protocol types for the Widuino hub and its clients.
//!
//! Holds the canonical RF frame and sensor records, the tagged RPC
//! request/reply unions, the length-delimited MsgPack framing they travel
//! in, and a client-side connection that multiplexes requests and
//! subscription streams over one TCP socket.

pub mod client;
pub mod frame;
pub mod message;
pub mod rpc;

pub use client::{ClientError, Connection, SensorDataSink};
pub use frame::{Envelope, EnvelopeCodec, FrameError, MAIN_CHANNEL, decode_body, encode_body};
pub use message::{RFMessage, SensorDataValue, SensorInfo};
pub use rpc::{ChannelId, Code, Reply, Request};
