//! Timestamp, window and identifier helpers.

mod ids;
pub mod timestamps;

pub use ids::{generate_id, natural_key};
pub use timestamps::{
    now_utc, saturating_add, saturating_sub, to_chrono, TimeWindow, Timestamp,
};
