//! Stratum v1 wire handling for the proxy.
//!
//! The protocol is JSON-RPC over TCP with newline-delimited messages. The
//! proxy does not speak the protocol itself; it only needs to find message
//! boundaries so that frames are forwarded whole, and to look inside
//! `mining.submit` requests so shares can be validated.
//!
//! # Protocol Overview
//!
//! Stratum v1 is a bidirectional, event-driven protocol:
//!
//! - **Client requests**: subscribe, authorize, submit, suggest_difficulty
//! - **Server notifications**: mining.notify (new work), mining.set_difficulty,
//!   mining.set_version_mask
//! - **Server responses**: Results for client requests (boolean or error array)
//!
//! # Usage
//!
//! ```rust,ignore
//! use stratum_v1::{FrameReader, FramingMode, SubmitParams};
//!
//! let mut reader = FrameReader::new(read_half, FramingMode::Line, DEFAULT_MAX_FRAME_SIZE);
//! while let Ok(frame) = reader.next_frame().await {
//!     if let Ok(Some(submit)) = SubmitParams::from_frame(&frame) {
//!         // route to a share validator
//!     }
//!     pool.write_all(&frame).await?;
//! }
//! ```

mod framer;
mod messages;

pub use framer::{FrameError, FrameReader, FramingMode, DEFAULT_MAX_FRAME_SIZE};
pub use messages::{
    error_line, response_line, rewrite_submit_worker, Extranonce, Message, Request, SubmitParams,
    MINING_AUTHORIZE, MINING_NOTIFY, MINING_SET_DIFFICULTY, MINING_SET_EXTRANONCE,
    MINING_SUBMIT, MINING_SUBSCRIBE,
};
