//! Fake POP3 server for integration testing
//!
//! Speaks enough of RFC 1939 (plus `CAPA`, `STLS`, `UIDL`, `TOP` and
//! `APOP`) to drive `Pop3Client` through a whole session.
//!
//! ## Module layout
//!
//! - `server` -- TCP listener, TLS setup, and connection loop
//! - `session` -- per-connection command handling
//! - `maildrop` -- test data model and builder

#![allow(dead_code)]

mod server;
mod session;

pub use maildrop::MaildropBuilder;
pub use server::{FakePop3Server, Pop3Behavior};
