//! Wire protocol for the gateway connection.
//!
//! This crate defines the frame shapes exchanged with the gateway:
//! - `OutboundFrame` - client-to-gateway requests
//! - `InboundFrame` - responses, push events, and the pre-auth challenge
//! - `ErrorBody` - the gateway's structured error shape

pub mod frame;

pub use frame::{ErrorBody, FrameError, InboundFrame, OutboundFrame, CHALLENGE_EVENT};
