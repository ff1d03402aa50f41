//! Refresh scheduling.
//!
//! Spends the background wake budget along the current refresh plan so the
//! displayed freshness tier keeps moving while the consumer is idle.

pub mod budget;
pub mod runner;
pub mod wake;

pub use budget::{BudgetError, WakeBudget};
pub use runner::{ArmOutcome, RefreshScheduler, WakeReport};
pub use wake::{TokioWakeFacility, WakeEvent, WakeFacility, WakeKind, WakeTicket};
