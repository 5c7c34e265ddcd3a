use chrono::{DateTime, Duration, Utc};

use crate::domain::event::Event;
use crate::domain::tracker::Tracker;

/// Session boundary policy.
///
/// `carry_over_slots` decides whether slot values survive a `SessionStarted`
/// event. `session_expiration` is the inactivity window after which a
/// returning conversation is given a fresh session; `None` means sessions
/// never expire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub carry_over_slots: bool,
    pub session_expiration: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { carry_over_slots: true, session_expiration: None }
    }
}

impl SessionConfig {
    pub fn with_expiration_minutes(minutes: u64) -> Self {
        let expiration = (minutes > 0).then(|| Duration::minutes(minutes as i64));
        Self { session_expiration: expiration, ..Self::default() }
    }

    /// Whether a message arriving at `now` must be preceded by a new
    /// `SessionStarted`.
    pub fn needs_new_session(&self, tracker: &Tracker, now: DateTime<Utc>) -> bool {
        if !tracker.in_session() {
            return true;
        }

        let Some(expiration) = self.session_expiration else {
            return false;
        };

        tracker.last_user_message_at().is_some_and(|last| now - last > expiration)
    }

    pub fn session_start_events(&self, now: DateTime<Utc>) -> Vec<Event> {
        vec![Event::session_started(now)]
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    use super::SessionConfig;
    use crate::domain::event::{Event, EventKind};
    use crate::domain::tracker::{ConversationId, Tracker};

    #[test]
    fn fresh_and_restarted_conversations_need_a_session() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("valid timestamp");
        let config = SessionConfig::default();

        let empty = Tracker::new(ConversationId::new("c1"), config.clone());
        assert!(config.needs_new_session(&empty, now));

        let restarted = Tracker::replay(
            ConversationId::new("c1"),
            vec![Event::session_started(now), Event::new(EventKind::Restarted, now)],
            config.clone(),
        );
        assert!(config.needs_new_session(&restarted, now));
    }

    #[test]
    fn expiration_applies_only_after_inactivity() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("valid timestamp");
        let config = SessionConfig::with_expiration_minutes(60);
        let tracker = Tracker::replay(
            ConversationId::new("c1"),
            vec![
                Event::session_started(start),
                Event::user("hi", start),
                Event::slot("name", json!("Alice"), start),
            ],
            config.clone(),
        );

        assert!(!config.needs_new_session(&tracker, start + Duration::minutes(30)));
        assert!(config.needs_new_session(&tracker, start + Duration::minutes(61)));
        assert!(
            !SessionConfig::default().needs_new_session(&tracker, start + Duration::days(30)),
            "sessions without expiration never lapse"
        );
    }

    #[test]
    fn zero_minutes_disables_expiration() {
        assert_eq!(SessionConfig::with_expiration_minutes(0).session_expiration, None);
    }
}
