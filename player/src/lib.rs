//! Client-side session state machine for a remote UNO room.
//!
//! A [Coordinator] owns the [TableState] for one seat and drives it from the
//! server's event feed, asking a [Strategy] for moves on our turn and sending
//! them through a [Gateway]. [recovery] persists enough to pick the seat back
//! up after a restart.

pub mod config;
pub mod coordinator;
mod error;
pub mod gateway;
pub mod legality;
mod reconcile;
pub mod recovery;
pub mod strategy;
pub mod summary;
pub mod table;

pub use config::{Config, ConfigError, ValidatedConfig};
pub use coordinator::{Coordinator, CoordinatorConfig, Phase, SessionOutcome};
pub use error::SessionError;
pub use gateway::Gateway;
pub use recovery::{resume, PointerStore, Resume};
pub use strategy::{Action, Deadline, Strategy};
pub use summary::{SummarySink, TracingSink};
pub use table::{TableState, TableView};
