//! Sign-in state for the single UI attached to this sidecar.
//!
//! The UI holds nothing but the opaque token returned by `auth.login` and
//! passes it on every protected request. The identity behind the token, and
//! what it may do, is resolved once at sign-in and kept here.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_TTL_MINUTES: i64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Faculty,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Some(Self::Student),
            "faculty" => Some(Self::Faculty),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Faculty => "faculty",
            Self::Admin => "admin",
        }
    }

    pub fn capabilities(self) -> &'static [Capability] {
        use Capability::*;
        match self {
            Self::Student => &[
                ViewOwnAttendance,
                ViewOwnMarks,
                ViewTimetable,
                ViewCirculars,
                ViewNotes,
                EditOwnProfile,
            ],
            Self::Faculty => &[
                ViewTimetable,
                EditTimetable,
                MarkAttendance,
                ViewClassAttendance,
                EnterMarks,
                ViewCirculars,
                PostCirculars,
                ViewNotes,
                UploadNotes,
                EditOwnProfile,
                UseFilters,
            ],
            Self::Admin => &[
                ViewTimetable,
                EditTimetable,
                MarkAttendance,
                ViewClassAttendance,
                EnterMarks,
                ViewCirculars,
                PostCirculars,
                ManageAnyCircular,
                ViewNotes,
                UploadNotes,
                EditOwnProfile,
                UseFilters,
                ManageDirectory,
                EditSetup,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ViewOwnAttendance,
    ViewOwnMarks,
    ViewTimetable,
    EditTimetable,
    MarkAttendance,
    ViewClassAttendance,
    EnterMarks,
    ViewCirculars,
    PostCirculars,
    ManageAnyCircular,
    ViewNotes,
    UploadNotes,
    EditOwnProfile,
    UseFilters,
    ManageDirectory,
    EditSetup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Student {
        user_id: String,
        student_id: String,
        name: String,
        dept_id: String,
        dept_code: String,
        semester: i64,
        section: String,
    },
    Faculty {
        user_id: String,
        faculty_id: String,
        name: String,
        dept_id: Option<String>,
    },
    Admin {
        user_id: String,
    },
}

impl Identity {
    pub fn role(&self) -> Role {
        match self {
            Self::Student { .. } => Role::Student,
            Self::Faculty { .. } => Role::Faculty,
            Self::Admin { .. } => Role::Admin,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Self::Student { user_id, .. }
            | Self::Faculty { user_id, .. }
            | Self::Admin { user_id } => user_id,
        }
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.role().capabilities().contains(&capability)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub token: String,
    pub identity: Identity,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Session {
    #[default]
    SignedOut,
    Authenticating {
        user_id: String,
    },
    Authenticated(SessionContext),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("not signed in")]
    NotSignedIn,
    #[error("missing token")]
    MissingToken,
    #[error("token does not match the active session")]
    TokenMismatch,
    #[error("session expired")]
    Expired,
}

impl Session {
    pub fn begin(&mut self, user_id: &str) {
        *self = Session::Authenticating {
            user_id: user_id.to_string(),
        };
    }

    /// Completes a sign-in started with `begin`. Any previous session is
    /// replaced, so at most one token is valid at a time.
    pub fn establish(
        &mut self,
        identity: Identity,
        ttl_minutes: i64,
        now: DateTime<Utc>,
    ) -> SessionContext {
        let ttl = Duration::minutes(ttl_minutes.max(1));
        let ctx = SessionContext {
            token: Uuid::new_v4().to_string(),
            identity,
            issued_at: now,
            expires_at: now + ttl,
        };
        *self = Session::Authenticated(ctx.clone());
        ctx
    }

    pub fn sign_out(&mut self) {
        *self = Session::SignedOut;
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Session::Authenticated(_))
    }

    pub fn current(&self) -> Option<&SessionContext> {
        match self {
            Session::Authenticated(ctx) => Some(ctx),
            _ => None,
        }
    }

    /// Checks the token on a protected request. Every failure tears the
    /// session down; the caller has to sign in again.
    pub fn authorize(
        &mut self,
        token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<SessionContext, SessionError> {
        let result = match (&*self, token) {
            (Session::Authenticated(_), None) => Err(SessionError::MissingToken),
            (Session::Authenticated(ctx), Some(t)) => {
                if ctx.token != t {
                    Err(SessionError::TokenMismatch)
                } else if now >= ctx.expires_at {
                    Err(SessionError::Expired)
                } else {
                    Ok(ctx.clone())
                }
            }
            _ => Err(SessionError::NotSignedIn),
        };
        if result.is_err() {
            self.sign_out();
        }
        result
    }

    /// Refreshes the identity of the active session after a profile edit.
    pub fn replace_identity(&mut self, identity: Identity) {
        if let Session::Authenticated(ctx) = self {
            ctx.identity = identity;
        }
    }
}

pub fn new_salt() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Rounds of salted SHA-256 applied to a stored password.
pub const PASSWORD_ROUNDS: u32 = 20_000;
const HASH_SCHEME: &str = "sha256";

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn stretch(salt: &str, password: &str, rounds: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    let mut digest = hasher.finalize();
    for _ in 1..rounds {
        let mut hasher = Sha256::new();
        hasher.update(digest);
        hasher.update(salt.as_bytes());
        hasher.update(password.as_bytes());
        digest = hasher.finalize();
    }
    to_hex(&digest)
}

/// Stored as `sha256$<rounds>$<hex>` so the round count can grow without
/// invalidating existing rows.
pub fn hash_password(salt: &str, password: &str) -> String {
    format!(
        "{}${}${}",
        HASH_SCHEME,
        PASSWORD_ROUNDS,
        stretch(salt, password, PASSWORD_ROUNDS)
    )
}

/// Accepts the versioned format and the single-round hex hashes written by
/// older workspaces.
pub fn verify_password(salt: &str, password: &str, expected_hash: &str) -> bool {
    let computed = match expected_hash.split('$').collect::<Vec<_>>().as_slice() {
        [scheme, rounds, _] if *scheme == HASH_SCHEME => match rounds.parse::<u32>() {
            Ok(n) if n > 0 => format!("{}${}${}", HASH_SCHEME, n, stretch(salt, password, n)),
            _ => return false,
        },
        [_legacy] => stretch(salt, password, 1),
        _ => return false,
    };
    constant_time_eq(computed.as_bytes(), expected_hash.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
