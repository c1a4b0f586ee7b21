use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Supervisor,
    Accountant,
    Parent,
}

impl Role {
    /// `teacher` is accepted as the older name for a supervisor account.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Self::Admin),
            "supervisor" | "teacher" => Some(Self::Supervisor),
            "accountant" => Some(Self::Accountant),
            "parent" => Some(Self::Parent),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Supervisor => "supervisor",
            Self::Accountant => "accountant",
            Self::Parent => "parent",
        }
    }

    pub fn can(self, cap: Capability) -> bool {
        use Capability::*;
        match self {
            Role::Admin => true,
            Role::Supervisor => matches!(cap, ViewStudents | RecordResults | ViewResults),
            Role::Accountant => matches!(
                cap,
                ViewStudents | ViewResults | ApproveResults | ManageFees
            ),
            Role::Parent => matches!(cap, ViewOwnChildren),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ManageUsers,
    ManageSchool,
    ViewStudents,
    RecordResults,
    ViewResults,
    ApproveResults,
    ManageFees,
    ViewOwnChildren,
    Backup,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::ManageUsers => "manage_users",
            Capability::ManageSchool => "manage_school",
            Capability::ViewStudents => "view_students",
            Capability::RecordResults => "record_results",
            Capability::ViewResults => "view_results",
            Capability::ApproveResults => "approve_results",
            Capability::ManageFees => "manage_fees",
            Capability::ViewOwnChildren => "view_own_children",
            Capability::Backup => "backup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AuthError {
    #[error("email address is not valid")]
    InvalidEmail,
    #[error("password must be at least 6 characters")]
    WeakPassword,
}

pub fn normalize_email(raw: &str) -> Result<String, AuthError> {
    let email = raw.trim().to_ascii_lowercase();
    let Some((local, domain)) = email.split_once('@') else {
        return Err(AuthError::InvalidEmail);
    };
    if local.is_empty()
        || domain.is_empty()
        || domain.contains('@')
        || !domain.contains('.')
        || email.chars().any(char::is_whitespace)
    {
        return Err(AuthError::InvalidEmail);
    }
    Ok(email)
}

pub fn validate_password(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::WeakPassword);
    }
    Ok(())
}

pub fn new_salt() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn verify_password(salt: &str, password: &str, expected_hash: &str) -> bool {
    let actual = hash_password(salt, password);
    // Constant-time over equal-length hex strings.
    actual.len() == expected_hash.len()
        && actual
            .bytes()
            .zip(expected_hash.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}
