//! Watch a child process's combined output and fire callbacks when new
//! output matches registered regex triggers.
//!
//! A session spawns a command, accumulates everything it prints, and
//! re-evaluates every trigger pattern against the accumulated text as each
//! chunk of output arrives. Only matches that are *new* since the last
//! evaluation are delivered, each exactly once, in text order. Triggers can
//! be registered at any time while output is flowing, and input can be fed
//! to the process through the same handle.
//!
//! # Example
//!
//! ```no_run
//! use cmd_watch::{CmdSession, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let session = CmdSession::spawn(SessionConfig::new("cargo", ["build"]))?;
//!
//!     session
//!         .add_trigger(r"error\[(?P<code>E\d+)\]", |m| {
//!             println!("compile error {} at byte {}", m.named["code"], m.start);
//!             Ok(())
//!         })
//!         .await?;
//!
//!     session.closed().await;
//!     Ok(())
//! }
//! ```
//!
//! Handlers run on the session's own task: keep them fast and
//! non-blocking. Calling [`CmdSession::destroy`] from inside a handler is
//! fine; awaiting other session methods from inside a handler is not.

mod buffer;
mod error;
mod session;
mod trigger;

pub use error::WatchError;
pub use regex::Regex;
pub use session::{CmdSession, SessionConfig, SessionState};
pub use trigger::{Backlog, MatchEvent, TriggerHandler};
