use crate::error::{AppError, AppResult};
use crate::models::{Role, UserProfile};
use crate::store;
use rusqlite::Connection;

/// Identity of the caller for one request. Resolved from
/// `params.session.userId` against the `users` collection and handed to the
/// operations that need it.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub role: Role,
    pub display_name: String,
}

impl Session {
    pub fn resolve(conn: &Connection, params: &serde_json::Value) -> AppResult<Self> {
        let user_id = params
            .get("session")
            .and_then(|s| s.get("userId"))
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::forbidden("missing session.userId"))?;
        let profile: UserProfile = store::get_typed(conn, store::USERS, user_id)?
            .ok_or_else(|| AppError::forbidden("unknown session user"))?;
        Ok(Self::from_profile(&profile))
    }

    pub fn from_profile(profile: &UserProfile) -> Self {
        Self {
            user_id: profile.id.clone(),
            role: profile.role,
            display_name: profile.display_name.clone(),
        }
    }

    pub fn is(&self, role: Role) -> bool {
        self.role == role
    }

    pub fn is_staff_admin(&self) -> bool {
        self.role.is_staff_admin()
    }

    pub fn require_any(&self, roles: &[Role], action: &str) -> AppResult<()> {
        if self.role == Role::Admin || roles.contains(&self.role) {
            Ok(())
        } else {
            Err(AppError::forbidden(format!(
                "{} may not {}",
                self.role.as_str(),
                action
            )))
        }
    }

    /// Owners may act on their own records; admins and headteachers on any.
    pub fn require_owner_or_admin(&self, owner_id: &str, action: &str) -> AppResult<()> {
        if self.user_id == owner_id || self.is_staff_admin() {
            Ok(())
        } else {
            Err(AppError::forbidden(format!("only the owner may {}", action)))
        }
    }
}
