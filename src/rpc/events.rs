//! Unsolicited daemon notifications, decoded into typed events.

use serde_json::Value;
use std::collections::HashSet;

use crate::cache::model::{Contact, Group};
use crate::session::SessionState;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    IncomingMessage(IncomingMessage),
    DeliveryReceipt(DeliveryReceipt),
    TypingIndicator(TypingIndicator),
    LinkingStatusChanged(LinkingStatusChanged),
    ContactsChanged(ContactsChanged),
    /// A frame was dropped because it could not be decoded
    ProtocolError { detail: String },
    /// Session state as seen by the facade
    Connectivity(SessionState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    Receipt,
    Typing,
    Linking,
    Contacts,
    ProtocolError,
    Connectivity,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::IncomingMessage(_) => EventKind::Message,
            Self::DeliveryReceipt(_) => EventKind::Receipt,
            Self::TypingIndicator(_) => EventKind::Typing,
            Self::LinkingStatusChanged(_) => EventKind::Linking,
            Self::ContactsChanged(_) => EventKind::Contacts,
            Self::ProtocolError { .. } => EventKind::ProtocolError,
            Self::Connectivity(_) => EventKind::Connectivity,
        }
    }

    /// Lossy events may be dropped under backpressure; the rest never are.
    pub fn is_lossy(&self) -> bool {
        !matches!(
            self.kind(),
            EventKind::Message | EventKind::Linking | EventKind::Contacts
        )
    }

    /// Conversation the event belongs to: the group if any, else the peer.
    pub fn conversation(&self) -> Option<&str> {
        match self {
            Self::IncomingMessage(m) => Some(m.group_id.as_deref().unwrap_or(&m.sender)),
            Self::TypingIndicator(t) => Some(t.group_id.as_deref().unwrap_or(&t.sender)),
            Self::DeliveryReceipt(r) => Some(&r.sender),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Number if known, else the service UUID
    pub sender: String,
    pub sender_uuid: Option<String>,
    pub sender_name: Option<String>,
    pub group_id: Option<String>,
    /// Sender timestamp, unix millis
    pub timestamp: u64,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub id: Option<String>,
    pub content_type: Option<String>,
    pub filename: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptKind {
    Delivery,
    Read,
    Viewed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub sender: String,
    pub kind: ReceiptKind,
    /// Timestamps of the messages being acknowledged
    pub timestamps: Vec<u64>,
    pub when: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingIndicator {
    pub sender: String,
    pub group_id: Option<String>,
    pub started: bool,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Confirmed,
    Expired,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkingStatusChanged {
    pub outcome: LinkOutcome,
    pub account: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContactsChanged {
    /// `None` means "something changed, refetch everything"
    pub delta: Option<ContactsDelta>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContactsDelta {
    pub contacts: Vec<Contact>,
    pub groups: Vec<Group>,
    /// Contact or group ids to drop
    pub removed: Vec<String>,
}

/// Which events a subscriber wants.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    kinds: Option<HashSet<EventKind>>,
    conversation: Option<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only<I: IntoIterator<Item = EventKind>>(kinds: I) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
            conversation: None,
        }
    }

    /// Restrict per-conversation events to one peer or group. Events with no
    /// conversation still pass.
    pub fn for_conversation(mut self, id: impl Into<String>) -> Self {
        self.conversation = Some(id.into());
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }
        match (&self.conversation, event.conversation()) {
            (Some(want), Some(got)) => want == got,
            _ => true,
        }
    }
}

/// Decode a notification frame. Unknown or uninteresting frames yield `None`.
pub fn parse_notification(frame: &Value) -> Option<Event> {
    if frame.get("contacts_changed").and_then(Value::as_bool) == Some(true) {
        return Some(Event::ContactsChanged(ContactsChanged::default()));
    }

    let method = frame
        .get("method")
        .or_else(|| frame.get("event"))
        .and_then(Value::as_str)?;
    let params = frame.get("params").unwrap_or(&Value::Null);

    match method {
        "receive" => params.get("envelope").and_then(parse_envelope),
        "linkingStatus" => parse_linking_status(params),
        "contactsChanged" => Some(Event::ContactsChanged(ContactsChanged {
            delta: parse_contacts_delta(params),
        })),
        _ => None,
    }
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn parse_envelope(env: &Value) -> Option<Event> {
    let sender_uuid = str_field(env, "sourceUuid");
    let sender = str_field(env, "sourceNumber")
        .or_else(|| str_field(env, "source"))
        .or_else(|| sender_uuid.clone())?;
    let envelope_ts = env.get("timestamp").and_then(Value::as_u64).unwrap_or(0);

    if let Some(data) = env.get("dataMessage").filter(|d| d.is_object()) {
        let body = str_field(data, "message").unwrap_or_default();
        let attachments: Vec<Attachment> = data
            .get("attachments")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(parse_attachment).collect())
            .unwrap_or_default();
        // reactions, group updates and the like carry neither
        if body.is_empty() && attachments.is_empty() {
            return None;
        }
        let group_id = data
            .get("groupInfo")
            .and_then(|g| str_field(g, "groupId"));
        return Some(Event::IncomingMessage(IncomingMessage {
            sender,
            sender_uuid,
            sender_name: str_field(env, "sourceName"),
            group_id,
            timestamp: data
                .get("timestamp")
                .and_then(Value::as_u64)
                .unwrap_or(envelope_ts),
            body,
            attachments,
        }));
    }

    if let Some(receipt) = env.get("receiptMessage").filter(|r| r.is_object()) {
        let flag = |k: &str| receipt.get(k).and_then(Value::as_bool).unwrap_or(false);
        let kind = if flag("isViewed") {
            ReceiptKind::Viewed
        } else if flag("isRead") {
            ReceiptKind::Read
        } else {
            ReceiptKind::Delivery
        };
        let timestamps = receipt
            .get("timestamps")
            .and_then(Value::as_array)
            .map(|ts| ts.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default();
        return Some(Event::DeliveryReceipt(DeliveryReceipt {
            sender,
            kind,
            timestamps,
            when: receipt
                .get("when")
                .and_then(Value::as_u64)
                .unwrap_or(envelope_ts),
        }));
    }

    if let Some(typing) = env.get("typingMessage").filter(|t| t.is_object()) {
        let started = typing
            .get("action")
            .and_then(Value::as_str)
            .map_or(false, |a| a.eq_ignore_ascii_case("STARTED"));
        return Some(Event::TypingIndicator(TypingIndicator {
            sender,
            group_id: str_field(typing, "groupId"),
            started,
            timestamp: typing
                .get("timestamp")
                .and_then(Value::as_u64)
                .unwrap_or(envelope_ts),
        }));
    }

    None
}

fn parse_attachment(v: &Value) -> Attachment {
    Attachment {
        id: str_field(v, "id"),
        content_type: str_field(v, "contentType"),
        filename: str_field(v, "filename"),
        size: v.get("size").and_then(Value::as_u64),
    }
}

fn parse_linking_status(params: &Value) -> Option<Event> {
    let status = params
        .get("status")
        .or_else(|| params.get("state"))
        .and_then(Value::as_str)?
        .to_ascii_lowercase();
    let outcome = match status.as_str() {
        "confirmed" | "linked" | "success" => LinkOutcome::Confirmed,
        "expired" | "timeout" => LinkOutcome::Expired,
        "failed" | "error" => LinkOutcome::Failed,
        _ => return None,
    };
    Some(Event::LinkingStatusChanged(LinkingStatusChanged {
        outcome,
        account: str_field(params, "account").or_else(|| str_field(params, "number")),
        message: str_field(params, "message"),
    }))
}

fn parse_contacts_delta(params: &Value) -> Option<ContactsDelta> {
    let list = |key: &str| params.get(key).and_then(Value::as_array);
    if list("contacts").is_none() && list("groups").is_none() && list("removed").is_none() {
        return None;
    }
    Some(ContactsDelta {
        contacts: list("contacts")
            .map(|items| items.iter().filter_map(Contact::from_signal_cli).collect())
            .unwrap_or_default(),
        groups: list("groups")
            .map(|items| items.iter().filter_map(Group::from_signal_cli).collect())
            .unwrap_or_default(),
        removed: list("removed")
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
    })
}
