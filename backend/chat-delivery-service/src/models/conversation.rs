use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub members: BTreeSet<String>,
    pub is_group: bool,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Member,
    NotMember,
    /// No conversation with that id exists yet
    Unknown,
}

impl Conversation {
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.contains(user_id)
    }

    /// Member set must be non-empty; a direct conversation has exactly two distinct members.
    pub fn validate(&self) -> AppResult<()> {
        if self.members.is_empty() {
            return Err(AppError::BadRequest(
                "conversation must have at least one member".into(),
            ));
        }
        if !self.is_group && self.members.len() != 2 {
            return Err(AppError::BadRequest(format!(
                "direct conversation needs exactly 2 distinct members, got {}",
                self.members.len()
            )));
        }
        Ok(())
    }
}
