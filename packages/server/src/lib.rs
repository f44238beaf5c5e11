//! PLM workflow coordination backend.
//!
//! The crate is organized around the generic `ratchet` engine:
//!
//! - `domains/tasks` — task lifecycle orchestration: dependency gating,
//!   auto-start propagation, review outcomes, rollback cascade.
//! - `domains/bom` — BOM change control: drafts, ECN diffing and numbering,
//!   versioned approval.
//! - `domains/routing` — routing rule administration over the core router.
//! - `kernel` — outbound ports (notification, external task tracker) and the
//!   action handlers bridging them to the engine's dispatcher.
//! - `server` — the axum HTTP surface with the `{code, message, data}`
//!   envelope.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::Config;
