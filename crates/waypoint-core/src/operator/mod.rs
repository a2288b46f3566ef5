//! Operator state machine
//!
//! Every waypoint runs one of three operator kinds:
//!
//! ```text
//!   GT    PreProcess ─▶ ProcessChunk* ─────────────────────────────▶ done
//!   GLA   PreProcess ─▶ ProcessChunk* ─▶ Merge* ─▶ PreFinalize ─┬─▶ Finalize* ─▶ PostFinalize
//!                          ▲                                    │
//!                          └──────────── iterate ───────────────┘
//!   GIST  PreProcess ─▶ [PrepareRound ─▶ DoSteps* ─▶ MergeRounds ─▶ ShouldIterate]+ ─▶ Finalize
//! ```
//!
//! User code implements the typed traits ([`Gla`], [`Gt`], [`Gist`]) plus a
//! descriptor; the engine drives the type-erased `*Ops` traits, which hand
//! states around as [`OperatorState`] and [`ConstantState`].

pub mod gist;
pub mod gla;
pub mod gt;
pub mod library;
mod state;

pub use gist::{Gist, GistDescriptor, GistOps, RoundPlan};
pub use gla::{Gla, GlaDescriptor, GlaOps, PreFinalize};
pub use gt::{Gt, GtDescriptor, GtOps};
pub use state::{ConstantInputs, ConstantState, OperatorState};
