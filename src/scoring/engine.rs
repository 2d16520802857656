use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::rubric::{Category, MAX_RATING, MIN_RATING, Ratings, Rubric};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScoreError {
    #[error("rating {rating} is outside 1..=5")]
    InvalidRating { rating: u8 },

    #[error("item weight must be an integer in 1..=100")]
    InvalidWeight,

    #[error("item {item} has no rating")]
    MissingRating { item: String },

    #[error("rating given for unknown item {item}")]
    UnknownItem { item: String },

    #[error("item {item} rated more than once")]
    DuplicateRating { item: String },

    #[error("item key {item} appears more than once in the rubric")]
    DuplicateItem { item: String },

    #[error("rubric has no categories")]
    EmptyRubric,

    #[error("category {category} has no items")]
    EmptyCategory { category: String },

    #[error("category {category}: item weights sum to {actual}, expected {expected}")]
    CategoryMismatch {
        category: String,
        expected: u32,
        actual: u32,
    },

    #[error("category maxima sum to {actual}, expected 100")]
    RubricTotal { actual: u32 },

    #[error("rubric weights overflow")]
    Overflow,
}

/// Points earned by one item: `round(rating / 5 * weight)`.
///
/// Integer arithmetic with half-up rounding, so the result is exact for every
/// weight and always lies in `round(weight / 5)..=weight`.
pub fn item_score(rating: u8, weight: u32) -> Result<u32, ScoreError> {
    if !(MIN_RATING..=MAX_RATING).contains(&rating) {
        return Err(ScoreError::InvalidRating { rating });
    }
    if weight == 0 {
        return Err(ScoreError::InvalidWeight);
    }
    let max = u64::from(MAX_RATING);
    let doubled = u64::from(rating) * u64::from(weight) * 2;
    let rounded = (doubled + max) / (2 * max);
    // rounded <= weight, so it always fits back into u32
    Ok(rounded as u32)
}

/// Sum of item scores for one category. Every item must be rated.
pub fn category_total(category: &Category, ratings: &Ratings) -> Result<u32, ScoreError> {
    category.items.iter().try_fold(0u32, |acc, item| {
        let rating = ratings
            .get(&item.key)
            .ok_or_else(|| ScoreError::MissingRating {
                item: item.key.clone(),
            })?;
        acc.checked_add(item_score(rating, item.points)?)
            .ok_or(ScoreError::Overflow)
    })
}

pub fn grand_total(rubric: &Rubric, ratings: &Ratings) -> Result<u32, ScoreError> {
    rubric
        .categories
        .iter()
        .try_fold(0u32, |acc, category| {
            acc.checked_add(category_total(category, ratings)?)
                .ok_or(ScoreError::Overflow)
        })
}

/// True iff every item of the rubric carries a rating.
pub fn is_complete(rubric: &Rubric, ratings: &Ratings) -> bool {
    rubric.items().all(|item| ratings.get(&item.key).is_some())
}

/// Performance level derived from a grand total.
///
/// Variants are declared from lowest to highest so `Ord` follows the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceBand {
    NeedsImprovement,
    Satisfactory,
    Good,
    VeryGood,
    Excellent,
}

impl PerformanceBand {
    pub const ALL: [PerformanceBand; 5] = [
        PerformanceBand::NeedsImprovement,
        PerformanceBand::Satisfactory,
        PerformanceBand::Good,
        PerformanceBand::VeryGood,
        PerformanceBand::Excellent,
    ];

    /// Lower bounds are inclusive, upper bounds exclusive; the top band
    /// closes at 100.
    pub fn classify(grand_total: u32) -> Self {
        match grand_total {
            90.. => PerformanceBand::Excellent,
            80..=89 => PerformanceBand::VeryGood,
            70..=79 => PerformanceBand::Good,
            60..=69 => PerformanceBand::Satisfactory,
            _ => PerformanceBand::NeedsImprovement,
        }
    }

    pub fn id(self) -> &'static str {
        match self {
            PerformanceBand::Excellent => "excellent",
            PerformanceBand::VeryGood => "very_good",
            PerformanceBand::Good => "good",
            PerformanceBand::Satisfactory => "satisfactory",
            PerformanceBand::NeedsImprovement => "needs_improvement",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PerformanceBand::Excellent => "Excellent",
            PerformanceBand::VeryGood => "Very Good",
            PerformanceBand::Good => "Good",
            PerformanceBand::Satisfactory => "Satisfactory",
            PerformanceBand::NeedsImprovement => "Needs Improvement",
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            PerformanceBand::Excellent => "#28a745",
            PerformanceBand::VeryGood => "#17a2b8",
            PerformanceBand::Good => "#007bff",
            PerformanceBand::Satisfactory => "#ffc107",
            PerformanceBand::NeedsImprovement => "#dc3545",
        }
    }

    pub fn lower_bound(self) -> u32 {
        match self {
            PerformanceBand::Excellent => 90,
            PerformanceBand::VeryGood => 80,
            PerformanceBand::Good => 70,
            PerformanceBand::Satisfactory => 60,
            PerformanceBand::NeedsImprovement => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ItemScore {
    pub key: String,
    pub rating: u8,
    pub points: u32,
    pub score: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CategoryScore {
    pub key: String,
    pub title: String,
    pub obtained: u32,
    pub max: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreCard {
    pub items: Vec<ItemScore>,
    pub categories: Vec<CategoryScore>,
    pub grand_total: u32,
    pub band: PerformanceBand,
}

/// Scores a complete rating set against a valid rubric.
///
/// Unlike the individual helpers this refuses anything questionable: an
/// invalid rubric, ratings for items the rubric does not know, and missing
/// ratings are all errors rather than being skipped or zero-filled.
pub fn score(rubric: &Rubric, ratings: &Ratings) -> Result<ScoreCard, ScoreError> {
    rubric.validate()?;

    if let Some(unknown) = ratings.keys().find(|k| rubric.find_item(k).is_none()) {
        return Err(ScoreError::UnknownItem {
            item: unknown.to_string(),
        });
    }

    let mut items = Vec::with_capacity(rubric.item_count());
    let mut categories = Vec::with_capacity(rubric.categories.len());

    for category in &rubric.categories {
        let mut obtained = 0u32;
        for item in &category.items {
            let rating = ratings
                .get(&item.key)
                .ok_or_else(|| ScoreError::MissingRating {
                    item: item.key.clone(),
                })?;
            let score = item_score(rating, item.points)?;
            obtained = obtained.checked_add(score).ok_or(ScoreError::Overflow)?;
            items.push(ItemScore {
                key: item.key.clone(),
                rating,
                points: item.points,
                score,
            });
        }
        categories.push(CategoryScore {
            key: category.key.clone(),
            title: category.title.clone(),
            obtained,
            max: category.max_points,
        });
    }

    let grand_total = categories
        .iter()
        .try_fold(0u32, |acc, c| acc.checked_add(c.obtained))
        .ok_or(ScoreError::Overflow)?;
    Ok(ScoreCard {
        items,
        categories,
        grand_total,
        band: PerformanceBand::classify(grand_total),
    })
}
