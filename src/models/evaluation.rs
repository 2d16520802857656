use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::scoring::{self, CategoryScore, PerformanceBand, Ratings, Rubric, ScoreCard, ScoreError};

pub const MAX_SESSION: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("session number {0} is outside 1..=8")]
    SessionOutOfRange(u8),

    #[error("visit number must be at least 1")]
    InvalidVisitNumber,

    #[error("please rate all criteria: {rated} of {required} rated")]
    Incomplete { rated: usize, required: usize },

    #[error(transparent)]
    Score(#[from] ScoreError),
}

/// One scored classroom visit.
///
/// `category_totals` and `grand_total` are derived from `ratings` and the
/// `rubric` snapshot; [`Evaluation::rescore`] rebuilds them and every store
/// calls it before writing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Evaluation {
    #[serde(default)]
    pub id: String,
    pub teacher_name: String,
    pub coordinator_name: String,
    #[serde(rename = "class")]
    pub class_label: String,
    pub subject: String,
    pub visit_date: NaiveDate,
    pub session_number: u8,
    #[serde(default)]
    pub visit_number: u32,
    #[serde(default = "Rubric::standard")]
    pub rubric: Rubric,
    pub ratings: Ratings,
    #[serde(default)]
    pub category_totals: Vec<CategoryScore>,
    #[serde(default)]
    pub grand_total: u32,
    pub strengths: String,
    pub to_improve: String,
    pub recommendations: String,
    #[serde(default = "crate::models::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

/// Fresh, time-ordered record id.
pub fn new_evaluation_id() -> String {
    Uuid::now_v7().to_string()
}

impl Evaluation {
    pub fn score_card(&self) -> Result<ScoreCard, ScoreError> {
        scoring::score(&self.rubric, &self.ratings)
    }

    /// Recomputes the derived totals from ratings and rubric snapshot.
    pub fn rescore(&mut self) -> Result<ScoreCard, ValidationError> {
        check_complete(&self.rubric, &self.ratings)?;
        let card = self.score_card()?;
        self.category_totals = card.categories.clone();
        self.grand_total = card.grand_total;
        Ok(card)
    }

    pub fn performance(&self) -> PerformanceBand {
        PerformanceBand::classify(self.grand_total)
    }

    /// Field checks only; call [`Evaluation::rescore`] for the ratings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require("id", &self.id)?;
        require_attributes(
            &self.teacher_name,
            &self.coordinator_name,
            &self.class_label,
            &self.subject,
            self.session_number,
        )?;
        require_commentary(&self.strengths, &self.to_improve, &self.recommendations)?;
        if self.visit_number == 0 {
            return Err(ValidationError::InvalidVisitNumber);
        }
        Ok(())
    }

    /// Validates and rescores in one go; what every write path runs.
    pub fn seal(&mut self) -> Result<ScoreCard, ValidationError> {
        self.validate()?;
        self.rescore()
    }
}

/// A finished evaluation form, before it has an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EvaluationDraft {
    pub teacher_name: String,
    pub coordinator_name: String,
    #[serde(rename = "class")]
    pub class_label: String,
    pub subject: String,
    pub visit_date: NaiveDate,
    pub session_number: u8,
    #[serde(default)]
    pub visit_number: Option<u32>,
    #[serde(default)]
    pub rubric: Option<Rubric>,
    pub ratings: Ratings,
    pub strengths: String,
    pub to_improve: String,
    pub recommendations: String,
}

impl EvaluationDraft {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_attributes(
            &self.teacher_name,
            &self.coordinator_name,
            &self.class_label,
            &self.subject,
            self.session_number,
        )?;
        require_commentary(&self.strengths, &self.to_improve, &self.recommendations)?;
        if self.visit_number == Some(0) {
            return Err(ValidationError::InvalidVisitNumber);
        }
        let rubric = self.rubric.clone().unwrap_or_else(Rubric::standard);
        check_complete(&rubric, &self.ratings)?;
        scoring::score(&rubric, &self.ratings)?;
        Ok(())
    }

    /// Turns the draft into a scored record. `next_visit` is used when the
    /// draft carries no visit number of its own.
    pub fn into_evaluation(
        self,
        id: String,
        next_visit: u32,
        created_at: DateTime<Utc>,
    ) -> Result<Evaluation, ValidationError> {
        let mut evaluation = Evaluation {
            id,
            teacher_name: self.teacher_name.trim().to_string(),
            coordinator_name: self.coordinator_name.trim().to_string(),
            class_label: self.class_label.trim().to_string(),
            subject: self.subject.trim().to_string(),
            visit_date: self.visit_date,
            session_number: self.session_number,
            visit_number: self.visit_number.unwrap_or(next_visit),
            rubric: self.rubric.unwrap_or_else(Rubric::standard),
            ratings: self.ratings,
            category_totals: Vec::new(),
            grand_total: 0,
            strengths: self.strengths,
            to_improve: self.to_improve,
            recommendations: self.recommendations,
            created_at,
            updated_at: None,
            synced_at: None,
        };
        evaluation.seal()?;
        Ok(evaluation)
    }
}

/// Partial update accepted by `PUT /evaluations/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EvaluationUpdate {
    #[serde(rename = "class")]
    pub class_label: Option<String>,
    pub subject: Option<String>,
    pub visit_date: Option<NaiveDate>,
    pub session_number: Option<u8>,
    pub ratings: Option<Ratings>,
    pub strengths: Option<String>,
    pub to_improve: Option<String>,
    pub recommendations: Option<String>,
}

impl EvaluationUpdate {
    pub fn apply(self, evaluation: &mut Evaluation, now: DateTime<Utc>) -> Result<(), ValidationError> {
        if let Some(class_label) = self.class_label {
            evaluation.class_label = class_label;
        }
        if let Some(subject) = self.subject {
            evaluation.subject = subject;
        }
        if let Some(visit_date) = self.visit_date {
            evaluation.visit_date = visit_date;
        }
        if let Some(session_number) = self.session_number {
            evaluation.session_number = session_number;
        }
        if let Some(ratings) = self.ratings {
            evaluation.ratings = ratings;
        }
        if let Some(strengths) = self.strengths {
            evaluation.strengths = strengths;
        }
        if let Some(to_improve) = self.to_improve {
            evaluation.to_improve = to_improve;
        }
        if let Some(recommendations) = self.recommendations {
            evaluation.recommendations = recommendations;
        }
        evaluation.updated_at = Some(now);
        evaluation.seal()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationFilter {
    pub teacher_name: Option<String>,
    pub coordinator_name: Option<String>,
}

impl EvaluationFilter {
    pub fn teacher(name: impl Into<String>) -> Self {
        Self {
            teacher_name: Some(name.into()),
            coordinator_name: None,
        }
    }

    pub fn matches(&self, evaluation: &Evaluation) -> bool {
        self.teacher_name
            .as_deref()
            .is_none_or(|t| evaluation.teacher_name == t)
            && self
                .coordinator_name
                .as_deref()
                .is_none_or(|c| evaluation.coordinator_name == c)
    }
}

fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(())
}

fn require_attributes(
    teacher_name: &str,
    coordinator_name: &str,
    class_label: &str,
    subject: &str,
    session_number: u8,
) -> Result<(), ValidationError> {
    require("teacherName", teacher_name)?;
    require("coordinatorName", coordinator_name)?;
    require("class", class_label)?;
    require("subject", subject)?;
    if !(1..=MAX_SESSION).contains(&session_number) {
        return Err(ValidationError::SessionOutOfRange(session_number));
    }
    Ok(())
}

fn require_commentary(
    strengths: &str,
    to_improve: &str,
    recommendations: &str,
) -> Result<(), ValidationError> {
    require("strengths", strengths)?;
    require("toImprove", to_improve)?;
    require("recommendations", recommendations)
}

fn check_complete(rubric: &Rubric, ratings: &Ratings) -> Result<(), ValidationError> {
    if !scoring::is_complete(rubric, ratings) {
        let rated = rubric
            .items()
            .filter(|i| ratings.get(&i.key).is_some())
            .count();
        return Err(ValidationError::Incomplete {
            rated,
            required: rubric.item_count(),
        });
    }
    Ok(())
}
