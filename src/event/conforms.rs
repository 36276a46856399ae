//! Syntactic conformance checking.
//!
//! A bitset of defects detectable from the event alone, before any database
//! access. Every predicate here is pure syntax; graph and authorization
//! checks live in the VM.

use std::fmt;

use super::{id, Event};

macro_rules! codes {
    ($($name:ident),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum Code {
            $($name),+
        }

        pub const CODES: &[Code] = &[$(Code::$name),+];

        impl Code {
            pub fn name(self) -> &'static str {
                match self {
                    $(Code::$name => stringify!($name)),+
                }
            }

            pub fn by_name(name: &str) -> Option<Code> {
                match name {
                    $(stringify!($name) => Some(Code::$name),)+
                    _ => None,
                }
            }
        }
    };
}

codes! {
    INVALID_OR_MISSING_EVENT_ID,
    INVALID_OR_MISSING_ROOM_ID,
    INVALID_OR_MISSING_SENDER_ID,
    MISSING_TYPE,
    MISSING_ORIGIN,
    INVALID_ORIGIN,
    INVALID_OR_MISSING_REDACTS_ID,
    MISSING_MEMBERSHIP,
    INVALID_MEMBERSHIP,
    MISSING_CONTENT_MEMBERSHIP,
    INVALID_CONTENT_MEMBERSHIP,
    MISSING_PREV_EVENTS,
    MISSING_PREV_STATE,
    DEPTH_NEGATIVE,
    DEPTH_ZERO,
    MISSING_SIGNATURES,
    MISSING_ORIGIN_SIGNATURE,
    MISMATCH_ORIGIN_SENDER,
    MISMATCH_ORIGIN_EVENT_ID,
    SELF_REDACTS,
    SELF_PREV_EVENT,
    SELF_PREV_STATE,
    DUP_PREV_EVENT,
    DUP_PREV_STATE,
}

/// Conformance report: one bit per [`Code`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Conforms {
    report: u64,
}

impl Conforms {
    pub fn check(event: &Event) -> Self {
        Self::check_masked(event, 0)
    }

    /// Check with a skip mask; locally-built events are checked before their
    /// id and signatures exist.
    pub fn check_masked(event: &Event, skip: u64) -> Self {
        let mut c = Conforms::default();
        c.run(event);
        c.report &= !skip;
        c
    }

    pub fn mask(codes: &[Code]) -> u64 {
        codes.iter().fold(0, |m, c| m | (1u64 << *c as u8))
    }

    fn run(&mut self, e: &Event) {
        let is_member = e.event_type == "m.room.member";
        let is_create = e.event_type == "m.room.create";

        if !e
            .event_id
            .as_deref()
            .is_some_and(|v| id::valid(id::Sigil::Event, v))
        {
            self.set(Code::INVALID_OR_MISSING_EVENT_ID);
        }

        if !id::valid(id::Sigil::Room, &e.room_id) {
            self.set(Code::INVALID_OR_MISSING_ROOM_ID);
        }

        if !id::valid(id::Sigil::User, &e.sender) {
            self.set(Code::INVALID_OR_MISSING_SENDER_ID);
        }

        if e.event_type.is_empty() {
            self.set(Code::MISSING_TYPE);
        }

        if e.origin.is_empty() {
            self.set(Code::MISSING_ORIGIN);
        } else if !id::valid_origin(&e.origin) {
            self.set(Code::INVALID_ORIGIN);
        }

        if e.signatures.is_empty() {
            self.set(Code::MISSING_SIGNATURES);
        }

        if e.signatures
            .get(&e.origin)
            .map_or(true, |keys| keys.is_empty())
        {
            self.set(Code::MISSING_ORIGIN_SIGNATURE);
        }

        if !self.has(Code::INVALID_OR_MISSING_SENDER_ID)
            && id::host(&e.sender).map_or(false, |h| h != e.origin)
        {
            self.set(Code::MISMATCH_ORIGIN_SENDER);
        }

        if !self.has(Code::INVALID_OR_MISSING_EVENT_ID)
            && e.event_id
                .as_deref()
                .and_then(|v| id::host(v).ok())
                .map_or(false, |h| h != e.origin)
        {
            self.set(Code::MISMATCH_ORIGIN_EVENT_ID);
        }

        if e.event_type == "m.room.redaction"
            && !e
                .redacts
                .as_deref()
                .is_some_and(|v| id::valid(id::Sigil::Event, v))
        {
            self.set(Code::INVALID_OR_MISSING_REDACTS_ID);
        }

        if let (Some(redacts), Some(event_id)) = (&e.redacts, &e.event_id) {
            if redacts == event_id {
                self.set(Code::SELF_REDACTS);
            }
        }

        if is_member {
            match e.membership.as_deref() {
                None | Some("") => self.set(Code::MISSING_MEMBERSHIP),
                Some(m) if !lower(m) => self.set(Code::INVALID_MEMBERSHIP),
                _ => {}
            }
            match e.content.get("membership").and_then(|v| v.as_str()) {
                None | Some("") => self.set(Code::MISSING_CONTENT_MEMBERSHIP),
                Some(m) if !lower(m) => self.set(Code::INVALID_CONTENT_MEMBERSHIP),
                _ => {}
            }
        }

        if !is_create && e.prev_events.is_empty() {
            self.set(Code::MISSING_PREV_EVENTS);
        }

        if !is_create && e.state_key.is_some() && e.prev_state.is_empty() {
            self.set(Code::MISSING_PREV_STATE);
        }

        if e.depth < 0 {
            self.set(Code::DEPTH_NEGATIVE);
        }

        if !is_create && e.depth == 0 {
            self.set(Code::DEPTH_ZERO);
        }

        for (i, prev) in e.prev_events.iter().enumerate() {
            if Some(prev) == e.event_id.as_ref() {
                self.set(Code::SELF_PREV_EVENT);
            }
            if e.prev_events[..i].contains(prev) {
                self.set(Code::DUP_PREV_EVENT);
            }
        }

        for (i, prev) in e.prev_state.iter().enumerate() {
            if Some(prev) == e.event_id.as_ref() {
                self.set(Code::SELF_PREV_STATE);
            }
            if e.prev_state[..i].contains(prev) {
                self.set(Code::DUP_PREV_STATE);
            }
        }
    }

    pub fn set(&mut self, code: Code) {
        self.report |= 1u64 << code as u8;
    }

    pub fn del(&mut self, code: Code) {
        self.report &= !(1u64 << code as u8);
    }

    pub fn has(&self, code: Code) -> bool {
        self.report & (1u64 << code as u8) != 0
    }

    pub fn clean(&self) -> bool {
        self.report == 0
    }

    pub fn count(&self) -> u32 {
        self.report.count_ones()
    }
}

impl fmt::Display for Conforms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for code in CODES {
            if self.has(*code) {
                if !first {
                    f.write_str(" ")?;
                }
                f.write_str(code.name())?;
                first = false;
            }
        }
        Ok(())
    }
}

fn lower(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_lowercase() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_event() -> Event {
        Event::from_value(&json!({
            "event_id": "$x:h",
            "room_id": "!r:h",
            "sender": "@a:h",
            "origin": "h",
            "type": "m.room.message",
            "depth": 3,
            "prev_events": ["$p:h"],
            "content": {"body": "hi"},
            "signatures": {"h": {"ed25519:0": "c2ln"}},
        }))
        .unwrap()
    }

    #[test]
    fn clean_event_reports_nothing() {
        let report = Conforms::check(&base_event());
        assert!(report.clean(), "unexpected: {report}");
    }

    #[test]
    fn negative_depth_and_missing_type() {
        let mut e = base_event();
        e.depth = -1;
        e.event_type.clear();

        let report = Conforms::check(&e);
        assert!(report.has(Code::DEPTH_NEGATIVE));
        assert!(report.has(Code::MISSING_TYPE));
        assert_eq!(report.count(), 2, "{report}");
    }

    #[test]
    fn origin_mismatches() {
        let mut e = base_event();
        e.origin = "h2".into();
        e.signatures.clear();

        let report = Conforms::check(&e);
        assert!(report.has(Code::MISMATCH_ORIGIN_SENDER));
        assert!(report.has(Code::MISMATCH_ORIGIN_EVENT_ID));
        assert!(report.has(Code::MISSING_SIGNATURES));
        assert!(report.has(Code::MISSING_ORIGIN_SIGNATURE));
    }

    #[test]
    fn member_requires_membership_in_both_places() {
        let mut e = base_event();
        e.event_type = "m.room.member".into();
        e.state_key = Some("@b:h".into());
        e.prev_state = vec!["$s:h".into()];

        let report = Conforms::check(&e);
        assert!(report.has(Code::MISSING_MEMBERSHIP));
        assert!(report.has(Code::MISSING_CONTENT_MEMBERSHIP));

        e.membership = Some("JOIN".into());
        e.content = json!({"membership": "join"});
        let report = Conforms::check(&e);
        assert!(report.has(Code::INVALID_MEMBERSHIP));
        assert!(!report.has(Code::MISSING_CONTENT_MEMBERSHIP));
    }

    #[test]
    fn duplicate_and_self_references() {
        let mut e = base_event();
        e.prev_events = vec!["$p:h".into(), "$p:h".into(), "$x:h".into()];

        let report = Conforms::check(&e);
        assert!(report.has(Code::DUP_PREV_EVENT));
        assert!(report.has(Code::SELF_PREV_EVENT));
    }

    #[test]
    fn create_event_is_exempt_from_prev_rules() {
        let e = Event::from_value(&json!({
            "event_id": "$c:h",
            "room_id": "!r:h",
            "sender": "@a:h",
            "origin": "h",
            "type": "m.room.create",
            "state_key": "",
            "depth": 0,
            "prev_events": [],
            "content": {"creator": "@a:h"},
            "signatures": {"h": {"ed25519:0": "c2ln"}},
        }))
        .unwrap();

        let report = Conforms::check(&e);
        assert!(report.clean(), "unexpected: {report}");
    }

    #[test]
    fn reflection_round_trips() {
        for code in CODES {
            assert_eq!(Code::by_name(code.name()), Some(*code));
        }
        assert_eq!(Code::by_name("NO_SUCH_CODE"), None);
    }

    #[test]
    fn skip_mask_suppresses_codes() {
        let mut e = base_event();
        e.event_id = None;
        e.signatures.clear();

        let skip = Conforms::mask(&[
            Code::INVALID_OR_MISSING_EVENT_ID,
            Code::MISSING_SIGNATURES,
            Code::MISSING_ORIGIN_SIGNATURE,
        ]);
        let report = Conforms::check_masked(&e, skip);
        assert!(report.clean(), "unexpected: {report}");
    }
}
