//! # logproto: binary codec and stream transport for structured log records
//!
//! A producer writes structured log events (time, level, message, nested attributes) as a
//! compact self-delimiting byte stream; a consumer reads the stream back record by record,
//! optionally keeping only records that satisfy a boolean filter expression.
//!
//! ## Wire format
//!
//! ```text
//! stream := frame* EOF
//! frame  := len:u32le payload[len]
//! ```
//!
//! The payload layout is described in [`codec`]. There is no magic, checksum or compression at
//! this layer; wrap the sink or source for that.
//!
//! ## Writing
//!
//! A [`Handler`] owns the sink. Derived handlers add attributes ([`Handler::with_attrs`]) or
//! open groups ([`Handler::with_group`]); each [`LogEvent`] is flattened into one attribute tree
//! and written as a single frame.
//!
//! ```
//! use logproto::{Attr, Handler, Level, LogEvent};
//!
//! let handler = Handler::new(Vec::<u8>::new());
//! let req = handler.with_group("req").with_attrs([Attr::string("id", "42")]);
//! req.handle(&LogEvent::new(Level::Info, "served").attr(Attr::int("status", 200))).unwrap();
//! assert!(!handler.lock_sink().is_empty());
//! ```
//!
//! ## Reading
//!
//! [`read`] and [`read_filtered`] drive a callback; [`Records`] is the iterator form. Filters
//! are compiled once with [`filter::compile`] and see the variables `msg`, `level`, `time` and
//! `attrs`.
//!
//! With the `layer` feature, [`layer::ProtoLayer`] adapts `tracing` events onto a handler.

pub mod codec;
pub mod filter;
pub mod frame;
pub mod handler;
#[cfg(feature = "layer")]
pub mod layer;
mod pool;
pub mod record;
pub mod stream;
pub mod value;

pub use codec::{Codec, CodecError};
pub use filter::{compile, FilterError, FilterProgram};
pub use frame::FrameError;
pub use handler::{Handler, HandlerError, HandlerOptions};
pub use record::{Level, LogEvent, Origin, Record};
pub use stream::{read, read_filtered, EvalErrorPolicy, ReadError, ReadSummary, ReaderConfig, Records};
pub use tokio_util::sync::CancellationToken;
pub use value::{Attr, AttrValue, Group, Json, LogValue, OpaqueValue, Value};
