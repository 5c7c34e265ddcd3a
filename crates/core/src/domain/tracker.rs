use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::event::{Event, EventKind, ACTION_LISTEN};
use crate::session::SessionConfig;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatestMessage {
    pub text: Option<String>,
    pub parse_data: Value,
    pub input_channel: Option<String>,
    pub message_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReminder {
    pub action_name: String,
    pub trigger_time: DateTime<Utc>,
    pub kill_on_user_message: bool,
}

/// Everything derived from a conversation's events. Never edited directly:
/// the only way to change it is [`Tracker::apply`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerState {
    pub slots: BTreeMap<String, Value>,
    pub latest_message: Option<LatestMessage>,
    pub latest_action_name: Option<String>,
    pub latest_bot_utterance: Option<String>,
    pub active_form: Option<String>,
    pub followup_action: Option<String>,
    pub paused: bool,
    pub reminders: BTreeMap<String, PendingReminder>,
    pub session_start_index: Option<usize>,
}

impl TrackerState {
    fn fold(&mut self, index: usize, event: &Event, session: &SessionConfig) {
        match &event.kind {
            EventKind::UserUttered { text, parse_data, input_channel, message_id } => {
                self.latest_message = Some(LatestMessage {
                    text: text.clone(),
                    parse_data: parse_data.clone(),
                    input_channel: input_channel.clone(),
                    message_id: message_id.clone(),
                });
                self.reminders.retain(|_, reminder| !reminder.kill_on_user_message);
            }
            EventKind::BotUttered { text, .. } => {
                self.latest_bot_utterance = text.clone();
            }
            EventKind::ActionExecuted { name, .. } => {
                self.latest_action_name = Some(name.clone());
                self.followup_action = None;
            }
            EventKind::SlotSet { name, value } => {
                self.slots.insert(name.clone(), value.clone());
            }
            EventKind::AllSlotsReset => self.slots.clear(),
            EventKind::ReminderScheduled {
                action_name,
                trigger_time,
                name,
                kill_on_user_message,
            } => {
                let key = name.clone().unwrap_or_else(|| action_name.clone());
                self.reminders.insert(
                    key,
                    PendingReminder {
                        action_name: action_name.clone(),
                        trigger_time: *trigger_time,
                        kill_on_user_message: *kill_on_user_message,
                    },
                );
            }
            EventKind::ReminderCancelled { action_name } => {
                self.reminders.retain(|_, reminder| &reminder.action_name != action_name);
            }
            EventKind::SessionStarted => {
                let slots = if session.carry_over_slots {
                    std::mem::take(&mut self.slots)
                } else {
                    BTreeMap::new()
                };
                let reminders = std::mem::take(&mut self.reminders);
                *self = Self { slots, reminders, session_start_index: Some(index), ..Self::default() };
            }
            EventKind::Restarted => *self = Self::default(),
            EventKind::ConversationPaused => self.paused = true,
            EventKind::ConversationResumed => self.paused = false,
            EventKind::FollowupAction { name } => self.followup_action = Some(name.clone()),
            EventKind::ActiveForm { name } => self.active_form = name.clone(),
            // Reverts are resolved by `Tracker::apply`; unknown kinds are inert.
            EventKind::UserUtteranceReverted
            | EventKind::ActionReverted
            | EventKind::Unknown { .. } => {}
        }
    }
}

/// Read-only projection handed to callers that only need the current state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    pub conversation_id: ConversationId,
    pub slots: BTreeMap<String, Value>,
    pub latest_action_name: Option<String>,
    pub latest_message_text: Option<String>,
    pub active_form: Option<String>,
    pub paused: bool,
    pub in_session: bool,
    pub version: u64,
}

/// One conversation's state, materialized from its ordered event history.
///
/// A tracker is a per-request view. The store owns the durable history; a
/// tracker loaded at version `n` is only valid for appends that expect `n`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tracker {
    conversation_id: ConversationId,
    session_config: SessionConfig,
    events: Vec<Event>,
    state: TrackerState,
}

impl Tracker {
    pub fn new(conversation_id: ConversationId, session_config: SessionConfig) -> Self {
        Self { conversation_id, session_config, events: Vec::new(), state: TrackerState::default() }
    }

    /// Rebuilds a tracker from scratch by folding `events` in order.
    pub fn replay(
        conversation_id: ConversationId,
        events: impl IntoIterator<Item = Event>,
        session_config: SessionConfig,
    ) -> Self {
        let mut tracker = Self::new(conversation_id, session_config);
        for event in events {
            tracker.apply(event);
        }
        tracker
    }

    /// Appends `event` to the history and folds it into the state.
    pub fn apply(&mut self, event: Event) {
        let index = self.events.len();
        let reverts =
            matches!(event.kind, EventKind::UserUtteranceReverted | EventKind::ActionReverted);
        self.events.push(event);

        if reverts {
            self.state = self.recompute();
        } else {
            self.state.fold(index, &self.events[index], &self.session_config);
        }
    }

    /// By-value form of [`Tracker::apply`].
    pub fn applied(mut self, event: Event) -> Self {
        self.apply(event);
        self
    }

    /// The events that still shape the state: everything after the last
    /// `Restarted`, with spans removed by `UserUtteranceReverted` (back to and
    /// including the previous user message) and `ActionReverted` (back to and
    /// including the previous non-listen action).
    pub fn applied_events(&self) -> Vec<(usize, &Event)> {
        let mut applied: Vec<(usize, &Event)> = Vec::new();

        for (index, event) in self.events.iter().enumerate() {
            match &event.kind {
                EventKind::Restarted => applied.clear(),
                EventKind::UserUtteranceReverted => undo_till(&mut applied, |candidate| {
                    matches!(candidate.kind, EventKind::UserUttered { .. })
                }),
                EventKind::ActionReverted => undo_till(&mut applied, |candidate| {
                    matches!(
                        &candidate.kind,
                        EventKind::ActionExecuted { name, .. } if name != ACTION_LISTEN
                    )
                }),
                _ => applied.push((index, event)),
            }
        }

        applied
    }

    fn recompute(&self) -> TrackerState {
        let mut state = TrackerState::default();
        for (index, event) in self.applied_events() {
            state.fold(index, event, &self.session_config);
        }
        state
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn session_config(&self) -> &SessionConfig {
        &self.session_config
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    /// Number of events in the history; the store's append sequence number.
    pub fn version(&self) -> u64 {
        self.events.len() as u64
    }

    pub fn state(&self) -> &TrackerState {
        &self.state
    }

    pub fn slots(&self) -> &BTreeMap<String, Value> {
        &self.state.slots
    }

    pub fn slot(&self, name: &str) -> Option<&Value> {
        self.state.slots.get(name)
    }

    pub fn latest_action_name(&self) -> Option<&str> {
        self.state.latest_action_name.as_deref()
    }

    pub fn latest_message(&self) -> Option<&LatestMessage> {
        self.state.latest_message.as_ref()
    }

    pub fn active_form(&self) -> Option<&str> {
        self.state.active_form.as_deref()
    }

    pub fn is_paused(&self) -> bool {
        self.state.paused
    }

    pub fn in_session(&self) -> bool {
        self.state.session_start_index.is_some()
    }

    /// Events since (and including) the most recent `SessionStarted`.
    pub fn current_session_events(&self) -> &[Event] {
        let start = self.state.session_start_index.unwrap_or(0).min(self.events.len());
        &self.events[start..]
    }

    pub fn last_user_message_at(&self) -> Option<DateTime<Utc>> {
        self.current_session_events()
            .iter()
            .rev()
            .find(|event| matches!(event.kind, EventKind::UserUttered { .. }))
            .map(|event| event.timestamp)
    }

    pub fn current_state(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            conversation_id: self.conversation_id.clone(),
            slots: self.state.slots.clone(),
            latest_action_name: self.state.latest_action_name.clone(),
            latest_message_text: self
                .state
                .latest_message
                .as_ref()
                .and_then(|message| message.text.clone()),
            active_form: self.state.active_form.clone(),
            paused: self.state.paused,
            in_session: self.in_session(),
            version: self.version(),
        }
    }
}

fn undo_till(applied: &mut Vec<(usize, &Event)>, is_boundary: impl Fn(&Event) -> bool) {
    while let Some((_, event)) = applied.pop() {
        if is_boundary(event) {
            break;
        }
    }
}
