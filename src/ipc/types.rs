use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

/// Resolved caller role. Identity and session handling live in the outer
/// layer; requests may carry an `actorRole` tag which must pass the
/// capability checks below when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Teacher,
    Student,
    Parent,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Role> {
        match raw {
            "ADMIN" => Some(Role::Admin),
            "TEACHER" => Some(Role::Teacher),
            "STUDENT" => Some(Role::Student),
            "PARENT" => Some(Role::Parent),
            _ => None,
        }
    }

    /// Creating or editing school records (classes, subjects, profiles).
    pub fn can_manage_school(self) -> bool {
        match self {
            Role::Admin => true,
            Role::Teacher | Role::Student | Role::Parent => false,
        }
    }

    /// Recording attendance marks and score entries.
    pub fn can_record_marks(self) -> bool {
        match self {
            Role::Admin | Role::Teacher => true,
            Role::Student | Role::Parent => false,
        }
    }
}
