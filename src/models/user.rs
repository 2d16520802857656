use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UserDirectoryError {
    #[error("failed to read users file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse users file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid users file: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Coordinator,
    Teacher,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct User {
    pub username: String,
    pub role: Role,
    #[serde(default)]
    pub assigned_teachers: Vec<String>,
    /// Hex SHA-256 of the user's secret. Never sent over the wire.
    #[serde(skip_serializing)]
    pub secret_sha256: String,
}

/// Hex-encoded SHA-256 digest of a secret.
pub fn secret_digest(secret: &str) -> String {
    format!("{:x}", Sha256::digest(secret.as_bytes()))
}

/// Static reference data: who may log in and whom each coordinator evaluates.
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    users: Vec<User>,
}

const BUILTIN_COORDINATORS: &[(&str, &[&str])] = &[
    (
        "Mohamed",
        &["Morched", "Kamel", "Abas", "Zine", "Youssef", "Oumarou", "Tonga", "Sylvano", "Sami", "Mohamed Ali"],
    ),
    (
        "Zohra",
        &["Aichetou", "Inas", "Anwar", "Souha", "Amal", "Shanouja", "Jana", "Hiba"],
    ),
    (
        "Rasha",
        &["Amal", "Rouba", "Rayan", "Imane", "Nesrine", "Fatima", "Samar", "Romana", "Nour"],
    ),
];

impl UserDirectory {
    pub fn new(users: Vec<User>) -> Result<Self, UserDirectoryError> {
        let mut seen = std::collections::HashSet::new();
        for user in &users {
            if user.username.trim().is_empty() {
                return Err(UserDirectoryError::Invalid("empty username".to_string()));
            }
            if !seen.insert(user.username.as_str()) {
                return Err(UserDirectoryError::Invalid(format!(
                    "duplicate username {}",
                    user.username
                )));
            }
            if user.role == Role::Teacher && !user.assigned_teachers.is_empty() {
                return Err(UserDirectoryError::Invalid(format!(
                    "teacher {} cannot have assigned teachers",
                    user.username
                )));
            }
        }
        Ok(Self { users })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, UserDirectoryError> {
        let raw = std::fs::read_to_string(path)?;
        let users: Vec<User> = serde_json::from_str(&raw)?;
        Self::new(users)
    }

    /// Development directory. Secrets default to the username; deployments
    /// are expected to supply a users file instead.
    pub fn builtin() -> Self {
        let mut users: Vec<User> = BUILTIN_COORDINATORS
            .iter()
            .map(|(name, teachers)| User {
                username: name.to_string(),
                role: Role::Coordinator,
                assigned_teachers: teachers.iter().map(|t| t.to_string()).collect(),
                secret_sha256: secret_digest(name),
            })
            .collect();

        let mut teachers: Vec<&str> = BUILTIN_COORDINATORS
            .iter()
            .flat_map(|(_, teachers)| teachers.iter().copied())
            .collect();
        teachers.sort_unstable();
        teachers.dedup();

        users.extend(teachers.into_iter().map(|name| User {
            username: name.to_string(),
            role: Role::Teacher,
            assigned_teachers: Vec::new(),
            secret_sha256: secret_digest(name),
        }));

        Self { users }
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn find(&self, username: &str) -> Option<&User> {
        self.users.iter().find(|u| u.username == username)
    }

    /// Digest comparison only; this is a lookup, not an authentication scheme.
    pub fn authenticate(&self, username: &str, secret: &str) -> Option<&User> {
        let digest = secret_digest(secret);
        self.find(username.trim())
            .filter(|u| u.secret_sha256.eq_ignore_ascii_case(&digest))
    }

    pub fn can_evaluate(&self, coordinator: &str, teacher: &str) -> bool {
        self.find(coordinator).is_some_and(|u| {
            u.role == Role::Coordinator && u.assigned_teachers.iter().any(|t| t == teacher)
        })
    }
}
