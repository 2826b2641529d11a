//! # accrue-engine: Virtual token accrual.
//!
//! Pure computation over [`accrue_core`] types; no I/O.
//!
//! - **Accrual**: one mining-loop pass per user mints over active spans at
//!   the adoption-curve rate, forwards referral shares and applies pending
//!   credits exactly once.
//! - **Slashing**: expired balances drain linearly over a configured number
//!   of days until a floor, and resurrection credits the gap back.
//! - **Referral propagation**: link confirmation and active-referral
//!   counter moves that never double count.
//! - **Recalculation**: retroactive re-derivation of the bucketed ledger
//!   with degradation and rollback.

pub mod accrual;
pub mod adoption;
pub mod recalculation;
pub mod referral;
pub mod settings;
pub mod slashing;
pub mod staking;
pub mod window;

pub use accrual::{AccrualEngine, AccrualOutcome, AccrualState};
pub use adoption::AdoptionCurve;
pub use recalculation::{RecalcInput, RecalcOutcome, Recalculator};
pub use referral::{Propagation, ReferralPropagator};
pub use settings::{EngineSettings, RecalcSettings};
pub use slashing::{ReferrerActivity, SlashingController, SlashingEffect};
