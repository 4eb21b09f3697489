//! Mutable per-user and per-community state owned by the engine.

mod activity;
mod community;
mod rate;

pub use activity::{is_new_or_inactive, ActivityStore};
pub use community::{CommunityConfig, CommunityStore};
pub use rate::RateLimiter;
