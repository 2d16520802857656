use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::engine::ScoreError;

/// Sum of all category maxima in a valid rubric.
pub const TOTAL_POINTS: u32 = 100;
pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Item {
    pub key: String,
    pub text: String,
    pub points: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Category {
    pub key: String,
    pub title: String,
    pub max_points: u32,
    pub items: Vec<Item>,
}

impl Category {
    fn weight_sum(&self) -> Result<u32, ScoreError> {
        self.items
            .iter()
            .try_fold(0u32, |acc, i| acc.checked_add(i.points))
            .ok_or(ScoreError::Overflow)
    }
}

/// Categories of weighted items making up the 100-point scale.
///
/// Every evaluation stores the rubric it was scored against, so changing the
/// standard rubric later never alters historic totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Rubric {
    pub categories: Vec<Category>,
}

impl Rubric {
    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.categories.iter().flat_map(|c| c.items.iter())
    }

    pub fn item_count(&self) -> usize {
        self.categories.iter().map(|c| c.items.len()).sum()
    }

    pub fn find_item(&self, key: &str) -> Option<&Item> {
        self.items().find(|i| i.key == key)
    }

    /// Checks the structural invariants: weights in `1..=100`, item weights
    /// adding up to their category maximum, maxima adding up to
    /// [`TOTAL_POINTS`], and item keys unique across the rubric.
    pub fn validate(&self) -> Result<(), ScoreError> {
        if self.categories.is_empty() {
            return Err(ScoreError::EmptyRubric);
        }

        let mut seen = HashSet::new();
        for category in &self.categories {
            if category.items.is_empty() {
                return Err(ScoreError::EmptyCategory {
                    category: category.key.clone(),
                });
            }
            for item in &category.items {
                if item.points == 0 || item.points > TOTAL_POINTS {
                    return Err(ScoreError::InvalidWeight);
                }
                if !seen.insert(item.key.as_str()) {
                    return Err(ScoreError::DuplicateItem {
                        item: item.key.clone(),
                    });
                }
            }
            let actual = category.weight_sum()?;
            if actual != category.max_points {
                return Err(ScoreError::CategoryMismatch {
                    category: category.key.clone(),
                    expected: category.max_points,
                    actual,
                });
            }
        }

        let total = self
            .categories
            .iter()
            .try_fold(0u32, |acc, c| acc.checked_add(c.max_points))
            .ok_or(ScoreError::Overflow)?;
        if total != TOTAL_POINTS {
            return Err(ScoreError::RubricTotal { actual: total });
        }
        Ok(())
    }

    /// The rubric used for new evaluations: four 25-point categories of five
    /// 5-point items each.
    pub fn standard() -> Self {
        let categories = STANDARD_RUBRIC
            .iter()
            .map(|(key, title, items)| Category {
                key: key.to_string(),
                title: title.to_string(),
                max_points: items.iter().map(|(_, _, points)| points).sum(),
                items: items
                    .iter()
                    .map(|(key, text, points)| Item {
                        key: key.to_string(),
                        text: text.to_string(),
                        points: *points,
                    })
                    .collect(),
            })
            .collect();
        Self { categories }
    }
}

type ItemSpec = (&'static str, &'static str, u32);

const STANDARD_RUBRIC: &[(&str, &str, &[ItemSpec])] = &[
    (
        "planning",
        "Planning and Preparation",
        &[
            ("planning.objectives", "Lesson objectives are clear and communicated to students", 5),
            ("planning.structure", "Lesson follows a coherent structure with timed phases", 5),
            ("planning.materials", "Materials and resources are ready and appropriate", 5),
            ("planning.differentiation", "Activities are differentiated for student needs", 5),
            ("planning.curriculum", "Content is aligned with the curriculum and prior learning", 5),
        ],
    ),
    (
        "management",
        "Classroom Management",
        &[
            ("management.routines", "Routines and transitions are efficient", 5),
            ("management.behaviour", "Expectations for behaviour are clear and applied consistently", 5),
            ("management.climate", "The classroom climate is respectful and supportive", 5),
            ("management.time", "Instructional time is used effectively", 5),
            ("management.space", "The physical space supports learning", 5),
        ],
    ),
    (
        "instruction",
        "Instruction and Pedagogy",
        &[
            ("instruction.explanations", "Explanations are accurate and accessible", 5),
            ("instruction.questioning", "Questioning promotes higher-order thinking", 5),
            ("instruction.engagement", "Students are actively engaged throughout the lesson", 5),
            ("instruction.methods", "A variety of teaching methods is used", 5),
            ("instruction.language", "Language of instruction is clear and correct", 5),
        ],
    ),
    (
        "assessment",
        "Assessment and Professionalism",
        &[
            ("assessment.checks", "Understanding is checked during the lesson", 5),
            ("assessment.feedback", "Feedback to students is timely and specific", 5),
            ("assessment.records", "Student progress is recorded and used for planning", 5),
            ("assessment.reflection", "The teacher reflects on practice and accepts feedback", 5),
            ("assessment.conduct", "Punctuality, presentation and professional conduct", 5),
        ],
    ),
];

/// One rating per rubric item, keyed by item key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ratings(BTreeMap<String, u8>);

impl Ratings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds ratings from `(item, rating)` pairs, refusing a second rating
    /// for the same item.
    pub fn from_pairs<I, K>(pairs: I) -> Result<Self, ScoreError>
    where
        I: IntoIterator<Item = (K, u8)>,
        K: Into<String>,
    {
        let mut ratings = Self::new();
        for (key, rating) in pairs {
            let key = key.into();
            if ratings.0.contains_key(&key) {
                return Err(ScoreError::DuplicateRating { item: key });
            }
            ratings.rate(key, rating)?;
        }
        Ok(ratings)
    }

    /// Sets (or replaces) the rating of one item.
    pub fn rate(&mut self, item: impl Into<String>, rating: u8) -> Result<(), ScoreError> {
        if !(MIN_RATING..=MAX_RATING).contains(&rating) {
            return Err(ScoreError::InvalidRating { rating });
        }
        self.0.insert(item.into(), rating);
        Ok(())
    }

    pub fn get(&self, item: &str) -> Option<u8> {
        self.0.get(item).copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Rates every item of `rubric` with the same value.
    pub fn uniform(rubric: &Rubric, rating: u8) -> Result<Self, ScoreError> {
        Self::from_pairs(rubric.items().map(|i| (i.key.clone(), rating)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_rubric_is_valid() {
        let rubric = Rubric::standard();
        rubric.validate().expect("standard rubric should validate");
        assert_eq!(rubric.categories.len(), 4);
        assert_eq!(rubric.item_count(), 20);
        assert!(rubric.categories.iter().all(|c| c.max_points == 25));
    }

    #[test]
    fn validate_rejects_weight_mismatch() {
        let mut rubric = Rubric::standard();
        rubric.categories[1].items[0].points = 4;

        let err = rubric.validate().unwrap_err();
        assert!(matches!(
            err,
            ScoreError::CategoryMismatch { ref category, expected: 25, actual: 24 } if category == "management"
        ));
    }

    #[test]
    fn validate_rejects_total_other_than_100() {
        let mut rubric = Rubric::standard();
        rubric.categories.pop();

        assert!(matches!(
            rubric.validate(),
            Err(ScoreError::RubricTotal { actual: 75 })
        ));
    }

    #[test]
    fn validate_rejects_duplicate_item_keys() {
        let mut rubric = Rubric::standard();
        rubric.categories[2].items[4].key = "planning.objectives".to_string();

        assert!(matches!(
            rubric.validate(),
            Err(ScoreError::DuplicateItem { .. })
        ));
    }

    #[test]
    fn validate_rejects_zero_weight() {
        let rubric = Rubric {
            categories: vec![Category {
                key: "only".to_string(),
                title: "Only".to_string(),
                max_points: 100,
                items: vec![
                    Item { key: "a".to_string(), text: "A".to_string(), points: 100 },
                    Item { key: "b".to_string(), text: "B".to_string(), points: 0 },
                ],
            }],
        };

        assert!(matches!(rubric.validate(), Err(ScoreError::InvalidWeight)));
    }

    #[test]
    fn validate_rejects_weights_that_would_wrap() {
        let rubric = Rubric {
            categories: vec![Category {
                key: "a".to_string(),
                title: "A".to_string(),
                max_points: 100,
                items: vec![
                    Item { key: "x".to_string(), text: "X".to_string(), points: u32::MAX },
                    Item { key: "y".to_string(), text: "Y".to_string(), points: 101 },
                ],
            }],
        };
        assert!(matches!(rubric.validate(), Err(ScoreError::InvalidWeight)));

        let ratings = Ratings::from_pairs([("x", 5), ("y", 5)]).unwrap();
        assert!(matches!(
            crate::scoring::score(&rubric, &ratings),
            Err(ScoreError::InvalidWeight)
        ));
    }

    #[test]
    fn validate_rejects_oversized_category_maximum() {
        let category = |key: &str, max: u32| Category {
            key: key.to_string(),
            title: key.to_uppercase(),
            max_points: max,
            items: vec![Item { key: format!("{key}.1"), text: "Item".to_string(), points: 50 }],
        };
        let rubric = Rubric {
            categories: vec![category("a", 50), category("b", 50), category("c", u32::MAX)],
        };
        let err = rubric.validate().unwrap_err();
        assert!(matches!(err, ScoreError::CategoryMismatch { .. }));

        let rubric = Rubric {
            categories: vec![category("a", 50), category("b", 50)],
        };
        rubric.validate().expect("two halves make a valid rubric");
    }

    #[test]
    fn ratings_reject_duplicates_and_out_of_range() {
        let dup = Ratings::from_pairs([("a", 3), ("a", 4)]);
        assert!(matches!(dup, Err(ScoreError::DuplicateRating { .. })));

        let mut ratings = Ratings::new();
        assert!(matches!(
            ratings.rate("a", 0),
            Err(ScoreError::InvalidRating { rating: 0 })
        ));
        assert!(matches!(
            ratings.rate("a", 6),
            Err(ScoreError::InvalidRating { rating: 6 })
        ));
        assert!(ratings.is_empty());
    }

    #[test]
    fn ratings_serialize_as_plain_object() {
        let ratings = Ratings::from_pairs([("x", 2), ("y", 5)]).unwrap();
        let json = serde_json::to_value(&ratings).unwrap();
        assert_eq!(json, serde_json::json!({ "x": 2, "y": 5 }));
    }
}
