//! Session plumbing between host and plugin.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Request, Response, CallEnvelope, ErrorKind)
//! - **codec**: length-delimited JSON framing for AsyncRead/AsyncWrite
//! - **transport**: local listener and the single host session

pub mod codec;
pub mod protocol;
pub mod transport;
