//! Client-side library for the Silicon Heaven (SHV) RPC ecosystem.
//!
//! One abstract value tree, two interchangeable encodings: ChainPack, a
//! compact self-describing binary format, and Cpon, a JSON-like text format
//! with tagged types and metadata. On top of the codecs sits the SHV-RPC
//! message view and a TCP client with length-prefixed framing, a login
//! handshake, blocking call correlation and `chng` signal dispatch.
//!
//! ```no_run
//! use libshv_rs::{ClientConnection, ConnectOptions};
//!
//! # async fn demo() -> Result<(), libshv_rs::Error> {
//! let opts = ConnectOptions::new("user", "password");
//! let conn = ClientConnection::connect("localhost", 3755, &opts).await?;
//! conn.set_value_change_handler("test/temp", |path, value| {
//!     println!("{} = {}", path, value);
//! });
//! conn.subscribe_path("test/temp").await?;
//! let resp = conn
//!     .call_shv_method_blocking(Some("test"), "ls", None)
//!     .await?;
//! println!("{}", resp);
//! # Ok(())
//! # }
//! ```

pub mod chainpack;
pub mod client;
pub mod connection;
pub mod constants;
pub mod context;
pub mod cpon;
pub mod error;
pub mod rpcmessage;
pub mod value;

pub use chainpack::{ChainPackReader, ChainPackWriter};
pub use client::{next_request_id, ConnectOptions, LoginType, RpcClient, State};
pub use connection::{ClientConnection, SignalHandler};
pub use cpon::{CponReader, CponWriter, CponWriterOptions};
pub use error::Error;
pub use rpcmessage::RpcMessage;
pub use value::{DateTime, Decimal, MetaMap, RpcValue, Value};
