//! Client-resident reconciliation: merges locally-optimistic sends,
//! server-confirmed rows and live gateway events into one ordered,
//! de-duplicated timeline.

pub mod merge;

pub use merge::{LiveEvent, Timeline, TimelineMessage, merge};
