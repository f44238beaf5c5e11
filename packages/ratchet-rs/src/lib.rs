//! # Ratchet
//!
//! A data-driven workflow coordination core: machine definitions decide,
//! transitions commit, side effects follow.
//!
//! ## Core Concepts
//!
//! Ratchet separates **state** from **side effects**:
//! - A [`MachineDef`] is data — states plus prioritized, guarded transition
//!   rows. New entity lifecycles are added by registering definitions, not
//!   by writing engine code.
//! - [`Engine::fire`] resolves the winning transition for an event and
//!   commits the state change and its audit record in one transaction,
//!   serialized per entity.
//! - [`ActionHandler`]s run strictly after commit. Their failures are
//!   recorded on the log row, never propagated into the transition result.
//!
//! ```text
//! fire(kind, id, event, ctx)
//!     │
//!     ├─► machine cache ─► candidates by priority ─► guards via predicate
//!     │
//!     ▼ one transaction (per-entity advisory lock)
//!     ├─► entity_states upsert
//!     └─► transition_logs append
//!     │
//!     ▼ after commit
//!     └─► ActionDispatcher ─► per-action outcomes back onto the log row
//! ```
//!
//! ## Key Invariants
//!
//! 1. **State is authoritative** — a committed transition stands even when
//!    every downstream action fails.
//! 2. **Per-entity total order** — concurrent firings on one entity
//!    serialize behind the advisory lock; history replays to the current
//!    state.
//! 3. **Guards are pure** — predicate evaluation does no IO and is shared
//!    verbatim by the [`Router`].
//! 4. **Handlers are idempotent** — the entity id is the deduplication key;
//!    the engine never retries on its own.

mod audit;
mod dispatch;
mod engine;
mod error;
mod machine;
mod pg;
mod predicate;
mod routing;
mod store;

// Re-export audit types
pub use audit::{ActionOutcome, ActionStatus, ActorKind, RoutingLogRow, TransitionRecord};

// Re-export dispatcher types
pub use dispatch::{ActionContext, ActionDispatcher, ActionHandler};

// Re-export engine types (primary entry point)
pub use engine::{resolve_transition, Engine, EngineBuilder, FireRequest};

// Re-export error types
pub use error::{EngineError, PredicateError};

// Re-export machine types
pub use machine::{ActionSpec, MachineDef, TransitionDef};

// Predicate evaluation (shared by guards and routing conditions)
pub use predicate::eval as eval_predicate;

// Re-export routing types
pub use routing::{Channel, RouteDecision, Router, RoutingRule};

// Re-export store types
pub use store::{
    AppliedTransition, ApplyRequest, EngineStore, ResetRequest, ResolvedTransition,
};

// Postgres store
pub use pg::PgEngineStore;

// In-memory store (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub use store::testing::InMemoryStore;

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
