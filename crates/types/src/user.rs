use crate::object::ObjectId;
use serde::{Deserialize, Serialize};

/// Registered account. Keyed by `username` in the `users` collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,

    /// Argon2 PHC string. Empty in token snapshots.
    #[serde(default)]
    pub password_hash: String,

    /// Owner index: ids of objects created by this user, in creation order.
    #[serde(default)]
    pub object_ids: Vec<ObjectId>,
}

impl User {
    pub fn new(username: impl Into<String>, password_hash: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password_hash: password_hash.into(),
            object_ids: Vec::new(),
        }
    }

    /// Copy embedded into issued tokens; never carries the password hash.
    pub fn snapshot(&self) -> Self {
        Self {
            username: self.username.clone(),
            password_hash: String::new(),
            object_ids: self.object_ids.clone(),
        }
    }

    /// Append to the owner index unless already present. Returns whether it changed.
    pub fn push_object_id(&mut self, id: ObjectId) -> bool {
        if self.object_ids.contains(&id) {
            return false;
        }
        self.object_ids.push(id);
        true
    }
}
