use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de, ser, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

pub const ACTION_LISTEN: &str = "action_listen";

/// Tags of every event kind this build knows how to fold. Anything else is
/// carried through as [`EventKind::Unknown`].
pub const KNOWN_EVENT_TAGS: &[&str] = &[
    "user",
    "bot",
    "action",
    "slot",
    "reset_slots",
    "reminder",
    "cancel_reminder",
    "session_started",
    "restart",
    "pause",
    "resume",
    "rewind",
    "undo",
    "followup",
    "form",
];

/// An immutable fact in a conversation's history.
///
/// Serialized as one flat JSON object: `{"event": "<tag>", "timestamp": ...,
/// <kind fields>}`. Timestamps are written as RFC 3339 and read from either
/// RFC 3339 strings or unix seconds.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum EventKind {
    #[serde(rename = "user")]
    UserUttered {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        parse_data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    #[serde(rename = "bot")]
    BotUttered {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        data: Value,
    },
    #[serde(rename = "action")]
    ActionExecuted {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        policy: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
    },
    #[serde(rename = "slot")]
    SlotSet {
        name: String,
        #[serde(default)]
        value: Value,
    },
    #[serde(rename = "reset_slots")]
    AllSlotsReset,
    #[serde(rename = "reminder")]
    ReminderScheduled {
        #[serde(rename = "action")]
        action_name: String,
        #[serde(rename = "date_time")]
        trigger_time: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(rename = "kill_on_user_msg", default = "default_kill_on_user_message")]
        kill_on_user_message: bool,
    },
    #[serde(rename = "cancel_reminder")]
    ReminderCancelled {
        #[serde(rename = "action")]
        action_name: String,
    },
    #[serde(rename = "session_started")]
    SessionStarted,
    #[serde(rename = "restart")]
    Restarted,
    #[serde(rename = "pause")]
    ConversationPaused,
    #[serde(rename = "resume")]
    ConversationResumed,
    #[serde(rename = "rewind")]
    UserUtteranceReverted,
    #[serde(rename = "undo")]
    ActionReverted,
    #[serde(rename = "followup")]
    FollowupAction { name: String },
    #[serde(rename = "form")]
    ActiveForm {
        #[serde(default)]
        name: Option<String>,
    },
    /// An event written by a newer producer. Kept verbatim so it survives a
    /// load/save cycle; folding it changes nothing.
    #[serde(skip)]
    Unknown { event: String, payload: Value },
}

fn default_kill_on_user_message() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("event must be a JSON object")]
    NotAnObject,
    #[error("event is missing its `event` tag")]
    MissingTag,
    #[error("event `{event}` has an invalid or missing timestamp")]
    InvalidTimestamp { event: String },
    #[error("event `{event}` has an invalid payload: {source}")]
    InvalidPayload { event: String, source: serde_json::Error },
}

impl EventKind {
    pub fn tag(&self) -> &str {
        match self {
            Self::UserUttered { .. } => "user",
            Self::BotUttered { .. } => "bot",
            Self::ActionExecuted { .. } => "action",
            Self::SlotSet { .. } => "slot",
            Self::AllSlotsReset => "reset_slots",
            Self::ReminderScheduled { .. } => "reminder",
            Self::ReminderCancelled { .. } => "cancel_reminder",
            Self::SessionStarted => "session_started",
            Self::Restarted => "restart",
            Self::ConversationPaused => "pause",
            Self::ConversationResumed => "resume",
            Self::UserUtteranceReverted => "rewind",
            Self::ActionReverted => "undo",
            Self::FollowupAction { .. } => "followup",
            Self::ActiveForm { .. } => "form",
            Self::Unknown { event, .. } => event.as_str(),
        }
    }
}

impl Event {
    pub fn new(kind: EventKind, timestamp: DateTime<Utc>) -> Self {
        Self { timestamp, kind }
    }

    pub fn user(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(
            EventKind::UserUttered {
                text: Some(text.into()),
                parse_data: Value::Null,
                input_channel: None,
                message_id: None,
            },
            timestamp,
        )
    }

    pub fn bot(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(EventKind::BotUttered { text: Some(text.into()), data: Value::Null }, timestamp)
    }

    pub fn action(name: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(
            EventKind::ActionExecuted { name: name.into(), policy: None, confidence: None },
            timestamp,
        )
    }

    pub fn slot(name: impl Into<String>, value: Value, timestamp: DateTime<Utc>) -> Self {
        Self::new(EventKind::SlotSet { name: name.into(), value }, timestamp)
    }

    pub fn session_started(timestamp: DateTime<Utc>) -> Self {
        Self::new(EventKind::SessionStarted, timestamp)
    }

    pub fn tag(&self) -> &str {
        self.kind.tag()
    }

    pub fn is_known(&self) -> bool {
        !matches!(self.kind, EventKind::Unknown { .. })
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        if let EventKind::Unknown { payload, .. } = &self.kind {
            return Ok(payload.clone());
        }

        let mut object = match serde_json::to_value(&self.kind)? {
            Value::Object(object) => object,
            _ => Map::new(),
        };
        object.insert(
            "timestamp".to_string(),
            Value::String(self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        Ok(Value::Object(object))
    }

    pub fn from_value(value: Value) -> Result<Self, EventDecodeError> {
        let Value::Object(mut object) = value else {
            return Err(EventDecodeError::NotAnObject);
        };
        let tag = object
            .get("event")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(EventDecodeError::MissingTag)?;
        let timestamp = object.get("timestamp").and_then(parse_timestamp);

        if !KNOWN_EVENT_TAGS.contains(&tag.as_str()) {
            return Ok(Self {
                timestamp: timestamp.unwrap_or_default(),
                kind: EventKind::Unknown { event: tag, payload: Value::Object(object) },
            });
        }

        let timestamp =
            timestamp.ok_or_else(|| EventDecodeError::InvalidTimestamp { event: tag.clone() })?;
        object.remove("timestamp");
        let kind = serde_json::from_value::<EventKind>(Value::Object(object))
            .map_err(|source| EventDecodeError::InvalidPayload { event: tag, source })?;

        Ok(Self { timestamp, kind })
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => {
            DateTime::parse_from_rfc3339(raw).ok().map(|parsed| parsed.with_timezone(&Utc))
        }
        Value::Number(number) => {
            let seconds = number.as_f64()?;
            if !seconds.is_finite() {
                return None;
            }
            let whole = seconds.floor();
            let nanos = ((seconds - whole) * 1_000_000_000.0).round() as u32;
            DateTime::<Utc>::from_timestamp(whole as i64, nanos.min(999_999_999))
        }
        _ => None,
    }
}

impl Serialize for Event {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_value().map_err(ser::Error::custom)?.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    use super::{Event, EventKind, KNOWN_EVENT_TAGS};

    fn at(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, second).single().expect("valid timestamp")
    }

    #[test]
    fn known_tags_match_serialized_tags() {
        let samples = vec![
            Event::user("hi", at(0)),
            Event::bot("hello", at(1)),
            Event::action("greet", at(2)),
            Event::slot("name", json!("Alice"), at(3)),
            Event::new(EventKind::AllSlotsReset, at(4)),
            Event::new(
                EventKind::ReminderScheduled {
                    action_name: "remind".to_string(),
                    trigger_time: at(30),
                    name: None,
                    kill_on_user_message: true,
                },
                at(5),
            ),
            Event::new(EventKind::ReminderCancelled { action_name: "remind".to_string() }, at(6)),
            Event::session_started(at(7)),
            Event::new(EventKind::Restarted, at(8)),
            Event::new(EventKind::ConversationPaused, at(9)),
            Event::new(EventKind::ConversationResumed, at(10)),
            Event::new(EventKind::UserUtteranceReverted, at(11)),
            Event::new(EventKind::ActionReverted, at(12)),
            Event::new(EventKind::FollowupAction { name: "ask".to_string() }, at(13)),
            Event::new(EventKind::ActiveForm { name: Some("booking".to_string()) }, at(14)),
        ];

        assert_eq!(samples.len(), KNOWN_EVENT_TAGS.len());
        for event in samples {
            let value = event.to_value().expect("serialize event");
            assert_eq!(value["event"], event.tag());
            assert!(KNOWN_EVENT_TAGS.contains(&event.tag()));
        }
    }

    #[test]
    fn unknown_events_survive_a_load_save_cycle() {
        let raw = json!({
            "event": "entities_added",
            "timestamp": 1_767_261_600.5,
            "entities": [{"entity": "city", "value": "Berlin"}]
        });

        let event: Event = serde_json::from_value(raw.clone()).expect("decode unknown event");
        assert!(!event.is_known());
        assert_eq!(event.tag(), "entities_added");

        let encoded = serde_json::to_value(&event).expect("encode unknown event");
        assert_eq!(encoded, raw);
    }

    #[test]
    fn reminder_uses_wire_field_names() {
        let raw = json!({
            "event": "reminder",
            "timestamp": "2026-03-01T09:00:00Z",
            "action": "action_nudge",
            "date_time": "2026-03-01T09:05:00Z"
        });

        let event = Event::from_value(raw).expect("decode reminder");
        match event.kind {
            EventKind::ReminderScheduled { action_name, kill_on_user_message, name, .. } => {
                assert_eq!(action_name, "action_nudge");
                assert!(kill_on_user_message, "reminders are killed by user messages by default");
                assert_eq!(name, None);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn known_event_without_timestamp_is_rejected() {
        let error = Event::from_value(json!({"event": "slot", "name": "x"}))
            .expect_err("timestamp is required");
        assert!(error.to_string().contains("timestamp"));
    }

    #[test]
    fn unix_second_timestamps_are_accepted() {
        let event = Event::from_value(json!({
            "event": "action",
            "timestamp": 1_767_261_600,
            "name": "greet"
        }))
        .expect("decode action");

        assert_eq!(event.timestamp.timestamp(), 1_767_261_600);
        assert_eq!(event.tag(), "action");
    }
}
