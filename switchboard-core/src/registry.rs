// src/registry.rs
//
// In-memory index of live interests. The persistent mirror lives in the
// repositories; this structure answers the hot-path questions: "who wants
// this key" and "does anyone still want this key".

use std::collections::HashSet;

use dashmap::DashMap;
use uuid::Uuid;

use crate::models::{Interest, InterestKey};

#[derive(Default)]
pub struct InterestRegistry {
    by_key: DashMap<InterestKey, HashSet<Uuid>>,
    interests: DashMap<Uuid, Interest>,
}

impl InterestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole index, e.g. at boot from the persisted rows.
    pub fn load(&self, interests: Vec<Interest>) {
        self.by_key.clear();
        self.interests.clear();
        for interest in interests {
            self.add(interest);
        }
    }

    pub fn add(&self, interest: Interest) -> InterestKey {
        let key = interest.key();
        self.by_key.entry(key.clone()).or_default().insert(interest.id);
        self.interests.insert(interest.id, interest);
        key
    }

    /// Remove one interest. Returns its key and whether any interest across
    /// all services still references that key.
    pub fn remove(&self, interest_id: Uuid) -> Option<(InterestKey, bool)> {
        let (_, interest) = self.interests.remove(&interest_id)?;
        let key = interest.key();
        let mut still_used = false;
        if let Some(mut ids) = self.by_key.get_mut(&key) {
            ids.remove(&interest_id);
            still_used = !ids.is_empty();
        }
        if !still_used {
            self.by_key.remove_if(&key, |_, ids| ids.is_empty());
        }
        Some((key, still_used))
    }

    pub fn get(&self, interest_id: Uuid) -> Option<Interest> {
        self.interests.get(&interest_id).map(|i| i.clone())
    }

    /// Snapshot of every interest matching `key`.
    pub fn interested(&self, key: &InterestKey) -> Vec<Interest> {
        let Some(ids) = self.by_key.get(key) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.interests.get(id).map(|i| i.clone()))
            .collect()
    }

    pub fn has_key(&self, key: &InterestKey) -> bool {
        self.by_key.get(key).map(|ids| !ids.is_empty()).unwrap_or(false)
    }

    pub fn keys(&self) -> Vec<InterestKey> {
        self.by_key.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn interests_for_service(&self, service_account_id: Uuid) -> Vec<Interest> {
        self.interests
            .iter()
            .filter(|entry| entry.service_account_id == service_account_id)
            .map(|entry| entry.clone())
            .collect()
    }

    /// Touch the in-memory copy so lookups see the freshened timestamps.
    pub fn replace(&self, interest: Interest) {
        self.interests.insert(interest.id, interest);
    }

    pub fn len(&self) -> usize {
        self.interests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeliveryRoute;
    use chrono::Utc;

    fn interest(service: Uuid, bot: Uuid, event_type: &str, broadcaster: &str) -> Interest {
        let now = Utc::now();
        Interest {
            id: Uuid::new_v4(),
            service_account_id: service,
            bot_account_id: bot,
            event_type: event_type.to_string(),
            broadcaster_user_id: broadcaster.to_string(),
            route: DeliveryRoute::Ws,
            created_at: now,
            updated_at: now,
            last_heartbeat_at: now,
        }
    }

    #[test]
    fn interests_sharing_a_key_fan_in() {
        let registry = InterestRegistry::new();
        let bot = Uuid::new_v4();
        let a = interest(Uuid::new_v4(), bot, "channel.follow", "123");
        let b = interest(Uuid::new_v4(), bot, "channel.follow", "123");
        let key = registry.add(a.clone());
        registry.add(b.clone());

        let matched = registry.interested(&key);
        assert_eq!(matched.len(), 2);
        assert_eq!(registry.keys().len(), 1);
    }

    #[test]
    fn remove_reports_whether_key_is_still_used() {
        let registry = InterestRegistry::new();
        let bot = Uuid::new_v4();
        let a = interest(Uuid::new_v4(), bot, "channel.follow", "123");
        let b = interest(Uuid::new_v4(), bot, "channel.follow", "123");
        registry.add(a.clone());
        registry.add(b.clone());

        let (key, still_used) = registry.remove(a.id).unwrap();
        assert!(still_used);
        let (_, still_used) = registry.remove(b.id).unwrap();
        assert!(!still_used);
        assert!(!registry.has_key(&key));
        assert!(registry.remove(b.id).is_none());
    }

    #[test]
    fn distinct_keys_do_not_interfere() {
        let registry = InterestRegistry::new();
        let bot = Uuid::new_v4();
        registry.add(interest(Uuid::new_v4(), bot, "channel.follow", "1"));
        registry.add(interest(Uuid::new_v4(), bot, "channel.cheer", "1"));
        registry.add(interest(Uuid::new_v4(), bot, "channel.follow", "2"));
        assert_eq!(registry.keys().len(), 3);
    }

    #[test]
    fn load_replaces_previous_contents() {
        let registry = InterestRegistry::new();
        let bot = Uuid::new_v4();
        registry.add(interest(Uuid::new_v4(), bot, "channel.follow", "1"));
        registry.load(vec![interest(Uuid::new_v4(), bot, "channel.cheer", "9")]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.keys()[0].event_type, "channel.cheer");
    }

    #[test]
    fn service_index_filters_by_owner() {
        let registry = InterestRegistry::new();
        let service = Uuid::new_v4();
        let bot = Uuid::new_v4();
        registry.add(interest(service, bot, "channel.follow", "1"));
        registry.add(interest(Uuid::new_v4(), bot, "channel.follow", "1"));
        assert_eq!(registry.interests_for_service(service).len(), 1);
    }
}
