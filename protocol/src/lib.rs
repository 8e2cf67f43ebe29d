//! Shared data types for the second-line broker.
//!
//! Everything in this crate is plain data: risk tiers, request statuses,
//! review decisions and the lifecycle events streamed to watchers. No I/O
//! happens here so both the core engine and the CLI front-end can depend on
//! these types without pulling in the store or the executor.

mod events;
mod types;

pub use events::Event;
pub use types::Attachment;
pub use types::AttachmentKind;
pub use types::Justification;
pub use types::PatternOrigin;
pub use types::RequestStatus;
pub use types::ReviewDecision;
pub use types::RiskTier;
