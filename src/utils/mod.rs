//! Conclave's shared utility modules.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod bitmap;
mod error;
mod safetcp;
mod timer;

pub use bitmap::Bitmap;
pub use error::ConclaveError;
pub use print::{logger_init, ME};
pub use timer::Timer;

pub(crate) use safetcp::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, tcp_connect_with_retry,
};
