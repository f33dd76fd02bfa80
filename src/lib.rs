//! Webshell - remote shell gateway with per-session sandboxes and command
//! admission control.
//!
//! - [`validator`] decides whether a command may reach a sandbox.
//! - [`state`] binds session ids to sandbox handles; [`janitor`] reaps idle ones.
//! - [`sandbox`] abstracts the isolation backend.
//! - [`shell`] composes them into the command execution path that
//!   [`http_server`] exposes.

pub mod config;
pub mod error;
pub mod http_server;
pub mod janitor;
pub mod policy;
pub mod sandbox;
pub mod shell;
pub mod state;
pub mod validator;

pub use error::ShellError;
pub use sandbox::{ExecOutput, ProviderError, SandboxHandle, SandboxProvider};
pub use shell::ShellService;
pub use state::{Session, SessionRegistry};
pub use validator::{CommandValidator, Verdict};
