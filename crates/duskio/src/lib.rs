//! `duskio`: async line transport for duskmire services.
//!
//! The wire unit is one UTF-8 line terminated by `\n` (an optional `\r`
//! before it is tolerated and stripped). Payload interpretation is left to
//! the caller; `duskproto` layers JSON on top.

pub mod line;

pub use line::{LineReader, LineWriter};
