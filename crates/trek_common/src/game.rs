//! Games and competitions

use crate::{new_local_id, SyncMeta};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single play session, optionally attached to a trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    pub meta: SyncMeta,
    pub user_id: String,
    pub trip_id: Option<String>,
    pub name: String,
    pub game_type: String,
    pub score: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl Game {
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        game_type: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            meta: SyncMeta::new(new_local_id(), now),
            user_id: user_id.into(),
            trip_id: None,
            name: name.into(),
            game_type: game_type.into(),
            score: 0,
            started_at: now,
            ended_at: None,
            is_active: true,
        }
    }

    pub fn finish(&mut self, at: DateTime<Utc>) {
        self.ended_at = Some(at);
        self.is_active = false;
    }
}

/// Scored contest between several users
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Competition {
    pub meta: SyncMeta,
    pub user_id: String,
    pub name: String,
    pub participant_ids: Vec<String>,
    pub scores: BTreeMap<String, i64>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl Competition {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        let user_id = user_id.into();
        Self {
            meta: SyncMeta::new(new_local_id(), now),
            participant_ids: vec![user_id.clone()],
            user_id,
            name: name.into(),
            scores: BTreeMap::new(),
            starts_at: now,
            ends_at: None,
            is_active: true,
        }
    }

    pub fn record_score(&mut self, user_id: &str, points: i64) {
        *self.scores.entry(user_id.to_string()).or_insert(0) += points;
    }

    pub fn leader(&self) -> Option<(&str, i64)> {
        self.scores
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(user, score)| (user.as_str(), *score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_competition_leader() {
        let mut comp = Competition::new("u1", "Summer", Utc::now());
        assert!(comp.leader().is_none());

        comp.record_score("u1", 3);
        comp.record_score("u2", 5);
        comp.record_score("u1", 1);
        assert_eq!(comp.leader(), Some(("u2", 5)));
    }

    #[test]
    fn test_finish_game() {
        let now = Utc::now();
        let mut game = Game::new("u1", "Plates", "license-plates", now);
        game.finish(now);
        assert!(!game.is_active);
        assert_eq!(game.ended_at, Some(now));
    }
}
