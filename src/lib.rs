//! resp-pipeline: a pipelined RESP client.
//!
//! Many requests share one connection and are in flight at the same time.
//! The server answers in request order and RESP carries no correlation
//! id, so every reply is matched to the oldest outstanding request.
//!
//! - [`protocol`]: RESP2 frames, the incremental reply parser and the
//!   request encoder
//! - [`Pipeline`]: the per-connection task and its hand-off channel
//! - [`Client`]: TCP connection setup plus a few typed commands
//!
//! ```no_run
//! use resp_pipeline::{Client, ClientConfig, Request};
//!
//! # async fn demo() -> resp_pipeline::Result<()> {
//! let client = Client::connect(ClientConfig::new("127.0.0.1:6379")).await?;
//! client.set("greeting", "hello").await?;
//!
//! // Submit without waiting, then collect the replies in any order.
//! let a = client.submit::<Option<String>>(Request::new("GET").arg("greeting")).await?;
//! let b = client.submit::<i64>(Request::new("INCR").arg("counter")).await?;
//! assert_eq!(a.await?.as_deref(), Some("hello"));
//! let _counter = b.await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod command;
pub mod config;
pub mod decoder;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod reply;

pub use client::{Client, Ttl};
pub use command::{Command, Request};
pub use config::{ClientConfig, PipelineConfig};
pub use error::{Error, Result};
pub use pipeline::Pipeline;
pub use protocol::{Frame, ParseLimits};
pub use reply::{FromFrame, ReplyFuture};
