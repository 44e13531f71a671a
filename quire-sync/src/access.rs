//! Who may open a project's files.
//!
//! The check runs once per `OpenFile`; the session caches the result for
//! the user, so later edits only test set membership.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

pub trait AccessControl: Send + Sync {
    /// Whether `user` may read and edit files in `owner`'s `project`.
    fn authorize(&self, user: &str, owner: &str, project: &str) -> bool;
}

/// Grants everyone access. The default for a local server.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn authorize(&self, _user: &str, _owner: &str, _project: &str) -> bool {
        true
    }
}

/// Owner always allowed; everyone else needs an explicit grant.
#[derive(Debug, Default)]
pub struct StaticAccess {
    grants: RwLock<HashMap<(String, String), HashSet<String>>>,
}

impl StaticAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, owner: &str, project: &str, user: &str) {
        if let Ok(mut grants) = self.grants.write() {
            grants
                .entry((owner.to_string(), project.to_string()))
                .or_default()
                .insert(user.to_string());
        }
    }

    pub fn revoke(&self, owner: &str, project: &str, user: &str) -> bool {
        self.grants
            .write()
            .ok()
            .and_then(|mut grants| {
                grants
                    .get_mut(&(owner.to_string(), project.to_string()))
                    .map(|users| users.remove(user))
            })
            .unwrap_or(false)
    }
}

impl AccessControl for StaticAccess {
    fn authorize(&self, user: &str, owner: &str, project: &str) -> bool {
        if user == owner {
            return true;
        }
        self.grants.read().is_ok_and(|grants| {
            grants
                .get(&(owner.to_string(), project.to_string()))
                .is_some_and(|users| users.contains(user))
        })
    }
}
