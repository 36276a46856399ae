//! Authorization predicates.
//!
//! An event is authorized at a state iff the type-specific predicate over
//! that state admits it. The state handed in is the one derived from the
//! event's auth_events resolved against the room (or the partial resolved
//! state during resolution); evaluation itself is pure.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{
    error::{Error, Result},
    event::{id, Event},
};

/// Power-level tables with the fixed defaults applied.
#[derive(Debug, Clone)]
pub struct PowerLevels {
    pub users: BTreeMap<String, i64>,
    pub users_default: i64,
    pub events: BTreeMap<String, i64>,
    pub events_default: i64,
    pub state_default: i64,
    pub ban: i64,
    pub kick: i64,
    pub redact: i64,
    pub invite: i64,
}

impl Default for PowerLevels {
    fn default() -> Self {
        Self {
            users: BTreeMap::new(),
            users_default: 0,
            events: BTreeMap::new(),
            events_default: 0,
            state_default: 50,
            ban: 50,
            kick: 50,
            redact: 50,
            invite: 0,
        }
    }
}

impl PowerLevels {
    pub fn from_content(content: &Value) -> Self {
        let mut levels = Self::default();
        levels.users = int_table(content.get("users"));
        levels.events = int_table(content.get("events"));
        if let Some(v) = int_field(content, "users_default") {
            levels.users_default = v;
        }
        if let Some(v) = int_field(content, "events_default") {
            levels.events_default = v;
        }
        if let Some(v) = int_field(content, "state_default") {
            levels.state_default = v;
        }
        if let Some(v) = int_field(content, "ban") {
            levels.ban = v;
        }
        if let Some(v) = int_field(content, "kick") {
            levels.kick = v;
        }
        if let Some(v) = int_field(content, "redact") {
            levels.redact = v;
        }
        if let Some(v) = int_field(content, "invite") {
            levels.invite = v;
        }
        levels
    }

    pub fn user_level(&self, user: &str) -> i64 {
        self.users.get(user).copied().unwrap_or(self.users_default)
    }

    pub fn required_for(&self, event_type: &str, is_state: bool) -> i64 {
        self.events.get(event_type).copied().unwrap_or(if is_state {
            self.state_default
        } else {
            self.events_default
        })
    }
}

fn int_table(value: Option<&Value>) -> BTreeMap<String, i64> {
    let mut out = BTreeMap::new();
    if let Some(Value::Object(map)) = value {
        for (k, v) in map {
            if let Some(level) = v.as_i64() {
                out.insert(k.clone(), level);
            }
        }
    }
    out
}

fn int_field(content: &Value, key: &str) -> Option<i64> {
    content.get(key).and_then(Value::as_i64)
}

/// The slice of room state authorization reads from: create, power levels,
/// join rules, and per-user memberships.
pub trait AuthState {
    fn create(&self) -> Result<Option<Event>>;
    fn power_levels(&self) -> Result<Option<Event>>;
    fn join_rules(&self) -> Result<Option<Event>>;
    fn member(&self, user: &str) -> Result<Option<Event>>;
}

fn effective_levels(state: &impl AuthState, create: &Event) -> Result<PowerLevels> {
    match state.power_levels()? {
        Some(event) => Ok(PowerLevels::from_content(&event.content)),
        None => {
            // no power_levels event yet: the creator holds 100
            let mut levels = PowerLevels::default();
            if let Some(creator) = create.content.get("creator").and_then(Value::as_str) {
                levels.users.insert(creator.to_owned(), 100);
            }
            Ok(levels)
        }
    }
}

fn membership_of(state: &impl AuthState, user: &str) -> Result<Option<String>> {
    Ok(state
        .member(user)?
        .and_then(|e| e.membership().map(str::to_owned)))
}

fn join_rule(state: &impl AuthState) -> Result<String> {
    Ok(state
        .join_rules()?
        .and_then(|e| {
            e.content
                .get("join_rule")
                .and_then(Value::as_str)
                .map(str::to_owned)
        })
        .unwrap_or_else(|| "invite".to_owned()))
}

/// Evaluate the type-specific predicates for `event` against `state`.
pub fn authorize(event: &Event, state: &impl AuthState) -> Result<()> {
    if event.is_create() {
        return authorize_create(event);
    }

    let create = state.create()?.ok_or_else(|| {
        Error::StateMissing("room has no create event in auth state".into())
    })?;
    let levels = effective_levels(state, &create)?;

    if event.event_type == "m.room.member" {
        return authorize_member(event, state, &levels);
    }

    // everything else requires a joined sender
    match membership_of(state, &event.sender)?.as_deref() {
        Some("join") => {}
        _ => {
            return Err(Error::Auth(format!(
                "sender {} is not joined to the room",
                event.sender
            )))
        }
    }

    let sender_level = levels.user_level(&event.sender);

    if event.event_type == "m.room.redaction" {
        if sender_level < levels.redact {
            return Err(Error::Auth(format!(
                "redaction requires level {}, sender has {}",
                levels.redact, sender_level
            )));
        }
        return Ok(());
    }

    let required = levels.required_for(&event.event_type, event.is_state());
    if sender_level < required {
        return Err(Error::Auth(format!(
            "{} requires level {required}, sender {} has {sender_level}",
            event.event_type, event.sender
        )));
    }

    // a power_levels change must not promote the sender above itself
    if event.event_type == "m.room.power_levels" {
        let proposed = PowerLevels::from_content(&event.content);
        let proposed_sender = proposed.user_level(&event.sender);
        for (user, level) in &proposed.users {
            if user != &event.sender && *level > sender_level {
                return Err(Error::Auth(format!(
                    "cannot grant {user} level {level} above own level {sender_level}"
                )));
            }
        }
        if proposed_sender > sender_level {
            return Err(Error::Auth(
                "cannot raise own power level".into(),
            ));
        }
    }

    Ok(())
}

fn authorize_create(event: &Event) -> Result<()> {
    if !event.prev_events.is_empty() || event.depth != 0 {
        return Err(Error::Auth(
            "create events carry depth 0 and no predecessors".into(),
        ));
    }
    let room_host = id::host(&event.room_id)?;
    let sender_host = id::host(&event.sender)?;
    if room_host != sender_host {
        return Err(Error::Auth(format!(
            "room host {room_host} does not match creator host {sender_host}"
        )));
    }
    match event.content.get("creator").and_then(Value::as_str) {
        Some(creator) if creator == event.sender => Ok(()),
        Some(creator) => Err(Error::Auth(format!(
            "creator {creator} is not the sender {}",
            event.sender
        ))),
        None => Err(Error::Auth("create event names no creator".into())),
    }
}

fn authorize_member(
    event: &Event,
    state: &impl AuthState,
    levels: &PowerLevels,
) -> Result<()> {
    let target = event
        .state_key
        .as_deref()
        .ok_or_else(|| Error::Auth("membership event has no state_key".into()))?;
    let membership = event
        .membership()
        .ok_or_else(|| Error::Auth("membership event has no membership".into()))?;

    let sender_membership = membership_of(state, &event.sender)?;
    let target_membership = membership_of(state, target)?;
    let sender_level = levels.user_level(&event.sender);
    let target_level = levels.user_level(target);

    match membership {
        "join" => {
            if event.sender != target {
                return Err(Error::Auth("cannot join on behalf of another user".into()));
            }
            match target_membership.as_deref() {
                Some("ban") => Err(Error::Auth(format!("{target} is banned"))),
                Some("join") | Some("invite") => Ok(()),
                _ => match join_rule(state)?.as_str() {
                    "public" => Ok(()),
                    rule => Err(Error::Auth(format!(
                        "join rule {rule} does not admit {target}"
                    ))),
                },
            }
        }
        "invite" => {
            if sender_membership.as_deref() != Some("join") {
                return Err(Error::Auth("inviter is not joined".into()));
            }
            if target_membership.as_deref() == Some("ban") {
                return Err(Error::Auth(format!("{target} is banned")));
            }
            if sender_level < levels.invite {
                return Err(Error::Auth(format!(
                    "invite requires level {}, sender has {sender_level}",
                    levels.invite
                )));
            }
            Ok(())
        }
        "leave" => {
            if event.sender == target {
                // voluntary leave, or rejecting an invite
                match sender_membership.as_deref() {
                    Some("join") | Some("invite") | Some("knock") => Ok(()),
                    _ => Err(Error::Auth(format!("{target} is not in the room"))),
                }
            } else {
                // kick
                if sender_membership.as_deref() != Some("join") {
                    return Err(Error::Auth("kicker is not joined".into()));
                }
                if target_membership.as_deref() == Some("ban") && sender_level < levels.ban {
                    return Err(Error::Auth("unban requires ban level".into()));
                }
                if sender_level < levels.kick || sender_level <= target_level {
                    return Err(Error::Auth(format!(
                        "kick requires level {} and more than target's {target_level}",
                        levels.kick
                    )));
                }
                Ok(())
            }
        }
        "ban" => {
            if sender_membership.as_deref() != Some("join") {
                return Err(Error::Auth("banner is not joined".into()));
            }
            if sender_level < levels.ban || sender_level <= target_level {
                return Err(Error::Auth(format!(
                    "ban requires level {} and more than target's {target_level}",
                    levels.ban
                )));
            }
            Ok(())
        }
        "knock" => {
            if event.sender != target {
                return Err(Error::Auth("cannot knock on behalf of another user".into()));
            }
            match join_rule(state)?.as_str() {
                "knock" => Ok(()),
                rule => Err(Error::Auth(format!("join rule {rule} does not admit knocks"))),
            }
        }
        other => Err(Error::Auth(format!("unknown membership '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FakeState {
        events: BTreeMap<(String, String), Event>,
    }

    impl FakeState {
        fn new() -> Self {
            Self {
                events: BTreeMap::new(),
            }
        }

        fn put(&mut self, event_type: &str, state_key: &str, content: Value) {
            let event = Event::from_value(&json!({
                "type": event_type,
                "state_key": state_key,
                "room_id": "!r:h",
                "sender": "@creator:h",
                "origin": "h",
                "content": content,
            }))
            .unwrap();
            self.events
                .insert((event_type.to_owned(), state_key.to_owned()), event);
        }
    }

    impl AuthState for FakeState {
        fn create(&self) -> Result<Option<Event>> {
            Ok(self.events.get(&("m.room.create".into(), "".into())).cloned())
        }
        fn power_levels(&self) -> Result<Option<Event>> {
            Ok(self
                .events
                .get(&("m.room.power_levels".into(), "".into()))
                .cloned())
        }
        fn join_rules(&self) -> Result<Option<Event>> {
            Ok(self
                .events
                .get(&("m.room.join_rules".into(), "".into()))
                .cloned())
        }
        fn member(&self, user: &str) -> Result<Option<Event>> {
            Ok(self
                .events
                .get(&("m.room.member".into(), user.into()))
                .cloned())
        }
    }

    fn room_with_creator() -> FakeState {
        let mut state = FakeState::new();
        state.put("m.room.create", "", json!({"creator": "@creator:h"}));
        state.put("m.room.member", "@creator:h", json!({"membership": "join"}));
        state
    }

    fn member_event(sender: &str, target: &str, membership: &str) -> Event {
        Event::from_value(&json!({
            "type": "m.room.member",
            "room_id": "!r:h",
            "sender": sender,
            "origin": "h",
            "state_key": target,
            "depth": 2,
            "prev_events": ["$p:h"],
            "content": {"membership": membership},
        }))
        .unwrap()
    }

    #[test]
    fn create_must_be_first_and_match_hosts() {
        let create = Event::from_value(&json!({
            "type": "m.room.create",
            "room_id": "!r:h",
            "sender": "@creator:h",
            "origin": "h",
            "depth": 0,
            "prev_events": [],
            "content": {"creator": "@creator:h"},
        }))
        .unwrap();
        authorize(&create, &FakeState::new()).unwrap();

        let foreign = Event::from_value(&json!({
            "type": "m.room.create",
            "room_id": "!r:other",
            "sender": "@creator:h",
            "origin": "h",
            "depth": 0,
            "prev_events": [],
            "content": {"creator": "@creator:h"},
        }))
        .unwrap();
        assert!(authorize(&foreign, &FakeState::new()).is_err());
    }

    #[test]
    fn public_room_admits_joins() {
        let mut state = room_with_creator();
        state.put("m.room.join_rules", "", json!({"join_rule": "public"}));

        authorize(&member_event("@new:h2", "@new:h2", "join"), &state).unwrap();
    }

    #[test]
    fn invite_only_room_rejects_strangers() {
        let mut state = room_with_creator();
        state.put("m.room.join_rules", "", json!({"join_rule": "invite"}));

        let err = authorize(&member_event("@new:h2", "@new:h2", "join"), &state).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));

        // but an invited user may join
        state.put("m.room.member", "@new:h2", json!({"membership": "invite"}));
        authorize(&member_event("@new:h2", "@new:h2", "join"), &state).unwrap();
    }

    #[test]
    fn banned_users_cannot_rejoin() {
        let mut state = room_with_creator();
        state.put("m.room.join_rules", "", json!({"join_rule": "public"}));
        state.put("m.room.member", "@bad:h2", json!({"membership": "ban"}));

        let err = authorize(&member_event("@bad:h2", "@bad:h2", "join"), &state).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn ban_requires_level_above_target() {
        let mut state = room_with_creator();
        state.put("m.room.member", "@mod:h", json!({"membership": "join"}));
        state.put("m.room.member", "@peer:h", json!({"membership": "join"}));
        state.put(
            "m.room.power_levels",
            "",
            json!({"users": {"@creator:h": 100, "@mod:h": 50, "@peer:h": 50}, "ban": 50}),
        );

        // equal level: rejected
        let err = authorize(&member_event("@mod:h", "@peer:h", "ban"), &state).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));

        // creator outranks: allowed
        authorize(&member_event("@creator:h", "@peer:h", "ban"), &state).unwrap();
    }

    #[test]
    fn state_changes_gate_on_power_level() {
        let mut state = room_with_creator();
        state.put("m.room.member", "@user:h", json!({"membership": "join"}));
        state.put(
            "m.room.power_levels",
            "",
            json!({"users": {"@creator:h": 100}, "state_default": 50}),
        );

        let name_event = Event::from_value(&json!({
            "type": "m.room.name",
            "room_id": "!r:h",
            "sender": "@user:h",
            "origin": "h",
            "state_key": "",
            "depth": 3,
            "prev_events": ["$p:h"],
            "content": {"name": "renamed"},
        }))
        .unwrap();
        assert!(matches!(
            authorize(&name_event, &state),
            Err(Error::Auth(_))
        ));

        let mut allowed = name_event.clone();
        allowed.sender = "@creator:h".into();
        authorize(&allowed, &state).unwrap();
    }

    #[test]
    fn power_levels_cannot_grant_above_own() {
        let mut state = room_with_creator();
        state.put("m.room.member", "@mod:h", json!({"membership": "join"}));
        state.put(
            "m.room.power_levels",
            "",
            json!({"users": {"@creator:h": 100, "@mod:h": 50}, "events": {"m.room.power_levels": 50}}),
        );

        let grab = Event::from_value(&json!({
            "type": "m.room.power_levels",
            "room_id": "!r:h",
            "sender": "@mod:h",
            "origin": "h",
            "state_key": "",
            "depth": 4,
            "prev_events": ["$p:h"],
            "content": {"users": {"@creator:h": 100, "@mod:h": 50, "@pal:h": 99}},
        }))
        .unwrap();
        assert!(matches!(authorize(&grab, &state), Err(Error::Auth(_))));
    }

    #[test]
    fn knock_needs_knock_rule() {
        let mut state = room_with_creator();
        state.put("m.room.join_rules", "", json!({"join_rule": "knock"}));
        authorize(&member_event("@shy:h2", "@shy:h2", "knock"), &state).unwrap();

        state.put("m.room.join_rules", "", json!({"join_rule": "invite"}));
        let err = authorize(&member_event("@shy:h2", "@shy:h2", "knock"), &state).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn defaults_apply_without_power_event() {
        let state = room_with_creator();
        // creator implicitly holds 100 and may set state
        let topic = Event::from_value(&json!({
            "type": "m.room.topic",
            "room_id": "!r:h",
            "sender": "@creator:h",
            "origin": "h",
            "state_key": "",
            "depth": 2,
            "prev_events": ["$p:h"],
            "content": {"topic": "hello"},
        }))
        .unwrap();
        authorize(&topic, &state).unwrap();
    }
}
