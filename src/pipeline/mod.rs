//! Email ingestion and reply threading.
//!
//! `scheduler` fans a poll out per tenant on a timer, `poller` runs one
//! fetch/match/persist/mark-read pass, and `reply` handles operator replies
//! going the other way.

pub mod poller;
pub mod reply;
pub mod scheduler;

pub use poller::{PollResult, poll, poll_imap};
pub use reply::send_operator_reply;
pub use scheduler::TenantScheduler;
