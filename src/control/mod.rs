//! Rate control loops
//!
//! A single PID loop ([`FeedbackController`]) and the two-loop
//! [`CascadeController`] built from it.

pub mod pid;
pub mod cascade;

pub use pid::{FeedbackController, FeedbackTerms, Gains, RateBounds};
pub use cascade::{CascadeController, CascadeMetrics, CascadeOutput, ControlParameters};
