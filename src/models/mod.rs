pub mod evaluation;
pub mod user;

use chrono::{DateTime, SubsecRound, Utc};

pub use evaluation::{
    Evaluation, EvaluationDraft, EvaluationFilter, EvaluationUpdate, ValidationError,
    new_evaluation_id,
};
pub use user::{Role, User, UserDirectory, UserDirectoryError, secret_digest};

/// Current time at the microsecond precision the stores keep.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
