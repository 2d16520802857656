//! Rubric scoring.
//!
//! Everything in here is pure: the same rubric and ratings always produce the
//! same figures, no matter how often or in which order the functions run.

pub mod engine;
pub mod rubric;

pub use engine::{
    CategoryScore, ItemScore, PerformanceBand, ScoreCard, ScoreError, category_total,
    grand_total, is_complete, item_score, score,
};
pub use rubric::{Category, Item, MAX_RATING, MIN_RATING, Ratings, Rubric, TOTAL_POINTS};
