//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

pub(crate) mod config;

mod error;
mod safetcp;

pub use config::Config;
pub use error::GeomysError;
pub(crate) use safetcp::{
    recv_frame, send_frame, tcp_bind_with_retry, tcp_connect_with_retry,
};
