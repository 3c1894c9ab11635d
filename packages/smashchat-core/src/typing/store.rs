use std::collections::HashMap;

use parking_lot::Mutex;

use super::TypingProfile;
use crate::error::Result;

/// Persistence for learned typing profiles.
pub trait TypingProfileStore: Send + Sync {
    /// Load the profile for a user
    fn get(&self, user_id: &str) -> Result<Option<TypingProfile>>;

    /// Atomically read-modify-write a user's profile.
    ///
    /// `f` receives the current profile (if any) and returns the one to
    /// store, or `None` to leave the record untouched.
    fn update(
        &self,
        user_id: &str,
        f: &mut dyn FnMut(Option<&TypingProfile>) -> Option<TypingProfile>,
    ) -> Result<Option<TypingProfile>>;
}

/// In-memory profile store; one lock serializes updates
#[derive(Debug, Default)]
pub struct MemoryTypingProfileStore {
    profiles: Mutex<HashMap<String, TypingProfile>>,
}

impl MemoryTypingProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TypingProfileStore for MemoryTypingProfileStore {
    fn get(&self, user_id: &str) -> Result<Option<TypingProfile>> {
        Ok(self.profiles.lock().get(user_id).cloned())
    }

    fn update(
        &self,
        user_id: &str,
        f: &mut dyn FnMut(Option<&TypingProfile>) -> Option<TypingProfile>,
    ) -> Result<Option<TypingProfile>> {
        let mut profiles = self.profiles.lock();
        let next = f(profiles.get(user_id));
        if let Some(ref profile) = next {
            profiles.insert(user_id.to_string(), profile.clone());
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typing::{KeyEvent, TypingProfiler};

    #[test]
    fn test_update_blends_in_place() {
        let store = MemoryTypingProfileStore::new();
        let profiler = TypingProfiler::default();
        let events = vec![
            KeyEvent::down("a", 0.0),
            KeyEvent::down("b", 100.0),
            KeyEvent::down("c", 220.0),
        ];

        for _ in 0..3 {
            store
                .update("alice", &mut |current| {
                    Some(profiler.evaluate(current, &events).profile)
                })
                .unwrap();
        }

        let stored = store.get("alice").unwrap().unwrap();
        assert_eq!(stored.samples, 3);
        assert!(store.get("bob").unwrap().is_none());
    }

    #[test]
    fn test_update_can_leave_record_untouched() {
        let store = MemoryTypingProfileStore::new();
        let result = store.update("alice", &mut |_| None).unwrap();
        assert!(result.is_none());
        assert!(store.get("alice").unwrap().is_none());
    }
}
