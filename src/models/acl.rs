//! Access control lists and the shared user group cache
//!
//! An ACL string is either `*` (allow everyone), the empty string (allow no
//! one) or two whitespace separated comma lists: the allowed users followed
//! by the allowed groups.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{LazyLock, RwLock};
use tracing::{event, Level};

use crate::Error;

/// A user and the groups it resolved to
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGroup {
    /// The name of this user
    pub user: String,
    /// The groups this user is a member of
    pub groups: Vec<String>,
}

impl UserGroup {
    /// Create a new user with groups
    ///
    /// # Arguments
    ///
    /// * `user` - The name of the user
    /// * `groups` - The groups this user is a member of
    pub fn new<T: Into<String>>(user: T, groups: Vec<String>) -> Self {
        UserGroup {
            user: user.into(),
            groups,
        }
    }
}

/// A parsed access control list
#[derive(Debug, Default, Clone)]
pub struct Acl {
    /// Whether this ACL allows everyone
    all_allowed: bool,
    /// The users this ACL allows
    users: HashSet<String>,
    /// The groups this ACL allows
    groups: HashSet<String>,
}

impl Acl {
    /// Parse an ACL from its string form
    ///
    /// # Arguments
    ///
    /// * `raw` - The raw ACL string to parse
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let trimmed = raw.trim();
        // a single wildcard allows everyone
        if trimmed == "*" {
            return Ok(Acl {
                all_allowed: true,
                ..Acl::default()
            });
        }
        // an empty ACL allows no one
        if trimmed.is_empty() {
            return Ok(Acl::default());
        }
        // anything else is a users chunk with an optional groups chunk
        let chunks: Vec<&str> = trimmed.split_whitespace().collect();
        if chunks.len() > 2 {
            return Err(Error::Config(format!(
                "ACL has too many fields, expected 'users groups': {raw}"
            )));
        }
        let users = split_list(chunks[0]);
        let groups = match chunks.get(1) {
            Some(list) => split_list(list),
            None => HashSet::default(),
        };
        // a wildcard inside either list also allows everyone
        let all_allowed = users.contains("*") || groups.contains("*");
        Ok(Acl {
            all_allowed,
            users,
            groups,
        })
    }

    /// Check if a user passes this ACL
    ///
    /// # Arguments
    ///
    /// * `user` - The user and groups to check
    #[must_use]
    pub fn check_access(&self, user: &UserGroup) -> bool {
        // the wildcard ACL admits everyone
        if self.all_allowed {
            return true;
        }
        // check the user list first
        if self.users.contains(&user.user) {
            return true;
        }
        // then check each of the users groups
        user.groups.iter().any(|group| self.groups.contains(group))
    }
}

/// Split a comma list into its entries
///
/// # Arguments
///
/// * `list` - The comma separated list to split
fn split_list(list: &str) -> HashSet<String> {
    list.split(',')
        .filter(|entry| !entry.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// The process wide cache of resolved user group info
static USER_GROUP_CACHE: LazyLock<RwLock<HashMap<String, UserGroup>>> =
    LazyLock::new(|| RwLock::new(HashMap::default()));

/// Resolve a user to its groups through the shared cache
///
/// Identity resolution is owned by the resource manager shims: an unknown
/// user resolves to itself as its only group until the shim seeds an entry.
///
/// # Arguments
///
/// * `user` - The user to resolve
pub fn resolve_user(user: &str) -> UserGroup {
    // try the cache under the read lock first
    if let Some(cached) = USER_GROUP_CACHE.read().unwrap().get(user) {
        return cached.clone();
    }
    // build the fallback resolution and cache it
    let resolved = UserGroup::new(user, vec![user.to_owned()]);
    event!(Level::DEBUG, user = user, msg = "caching fallback user info");
    USER_GROUP_CACHE
        .write()
        .unwrap()
        .insert(user.to_owned(), resolved.clone());
    resolved
}

/// Seed or replace a resolved user in the shared cache
///
/// # Arguments
///
/// * `resolved` - The resolved user info to cache
pub fn cache_user(resolved: UserGroup) {
    USER_GROUP_CACHE
        .write()
        .unwrap()
        .insert(resolved.user.clone(), resolved);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_allows_everyone() {
        let acl = Acl::parse("*").unwrap();
        assert!(acl.check_access(&UserGroup::new("anyone", vec![])));
    }

    #[test]
    fn empty_allows_no_one() {
        let acl = Acl::parse("").unwrap();
        assert!(!acl.check_access(&UserGroup::new("anyone", vec![])));
        let spaced = Acl::parse("   ").unwrap();
        assert!(!spaced.check_access(&UserGroup::new("anyone", vec![])));
    }

    #[test]
    fn user_and_group_lists() {
        let acl = Acl::parse("alice,bob devs,ops").unwrap();
        assert!(acl.check_access(&UserGroup::new("alice", vec![])));
        assert!(acl.check_access(&UserGroup::new("carol", vec!["ops".to_owned()])));
        assert!(!acl.check_access(&UserGroup::new("carol", vec!["qa".to_owned()])));
    }

    #[test]
    fn users_only_list() {
        let acl = Acl::parse("alice").unwrap();
        assert!(acl.check_access(&UserGroup::new("alice", vec![])));
        assert!(!acl.check_access(&UserGroup::new("bob", vec!["alice".to_owned()])));
    }

    #[test]
    fn embedded_wildcard_allows_everyone() {
        let acl = Acl::parse("alice *").unwrap();
        assert!(acl.check_access(&UserGroup::new("bob", vec!["qa".to_owned()])));
    }

    #[test]
    fn too_many_fields_is_rejected() {
        assert!(Acl::parse("users groups extra").is_err());
    }

    #[test]
    fn unknown_user_resolves_to_itself() {
        let resolved = resolve_user("dave");
        assert_eq!(resolved.user, "dave");
        assert_eq!(resolved.groups, vec!["dave".to_owned()]);
    }
}
