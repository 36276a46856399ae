//! Sigil identifiers.
//!
//! Rooms, users, events, and aliases share one grammar: a one-byte sigil,
//! an opaque localpart, and the host of the server that minted the id.

use crate::error::{Error, Result};

pub const SIGIL_ROOM: char = '!';
pub const SIGIL_USER: char = '@';
pub const SIGIL_ALIAS: char = '#';
pub const SIGIL_EVENT: char = '$';

pub const MAX_ID_LENGTH: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sigil {
    Room,
    User,
    Alias,
    Event,
}

impl Sigil {
    pub fn char(self) -> char {
        match self {
            Sigil::Room => SIGIL_ROOM,
            Sigil::User => SIGIL_USER,
            Sigil::Alias => SIGIL_ALIAS,
            Sigil::Event => SIGIL_EVENT,
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            SIGIL_ROOM => Some(Sigil::Room),
            SIGIL_USER => Some(Sigil::User),
            SIGIL_ALIAS => Some(Sigil::Alias),
            SIGIL_EVENT => Some(Sigil::Event),
            _ => None,
        }
    }
}

/// Syntactic validity of an id against an expected sigil. No lookups.
pub fn valid(sigil: Sigil, id: &str) -> bool {
    if id.len() < 4 || id.len() > MAX_ID_LENGTH {
        return false;
    }
    if !id.starts_with(sigil.char()) {
        return false;
    }
    let rest = &id[1..];
    let Some(colon) = rest.find(':') else {
        return false;
    };
    let (localpart, host) = rest.split_at(colon);
    let host = &host[1..];
    !localpart.is_empty() && valid_host(host)
}

/// Host part of a sigil id, or an error when the id has none.
pub fn host(id: &str) -> Result<&str> {
    if id.len() < 2 {
        return Err(Error::BadJson(format!("id '{id}' has no host part")));
    }
    match id[1..].find(':') {
        Some(colon) => Ok(&id[colon + 2..]),
        None => Err(Error::BadJson(format!("id '{id}' has no host part"))),
    }
}

pub fn localpart(id: &str) -> Result<&str> {
    if id.len() < 2 {
        return Err(Error::BadJson(format!("id '{id}' has no localpart")));
    }
    match id[1..].find(':') {
        Some(colon) => Ok(&id[1..colon + 1]),
        None => Err(Error::BadJson(format!("id '{id}' has no host part"))),
    }
}

/// Compose an id from parts; callers pass an already-encoded localpart.
pub fn build(sigil: Sigil, localpart: &str, host: &str) -> String {
    format!("{}{}:{}", sigil.char(), localpart, host)
}

/// Origins are bare hosts: no sigil, no localpart.
pub fn valid_origin(origin: &str) -> bool {
    valid_host(origin)
}

fn valid_host(host: &str) -> bool {
    if host.is_empty() || host.len() > 255 {
        return false;
    }
    // hostname, optionally with a port; IPv6 literals arrive bracketed
    let (name, port) = match host.rfind(':') {
        Some(i) if !host.contains('[') => (&host[..i], Some(&host[i + 1..])),
        _ => (host, None),
    };
    if let Some(port) = port {
        if port.is_empty() || port.parse::<u16>().is_err() {
            return false;
        }
    }
    !name.is_empty()
        && name.chars().all(|c| {
            c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '[' || c == ']' || c == ':'
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_ids() {
        assert!(valid(Sigil::Room, "!abc:example.org"));
        assert!(valid(Sigil::User, "@alice:example.org"));
        assert!(valid(Sigil::Event, "$deadbeef:example.org:8448"));
        assert!(valid(Sigil::Alias, "#general:example.org"));
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(!valid(Sigil::Room, "abc:example.org"));
        assert!(!valid(Sigil::Room, "!abc"));
        assert!(!valid(Sigil::Room, "!:example.org"));
        assert!(!valid(Sigil::User, "!abc:example.org"));
        assert!(!valid(Sigil::Event, ""));
    }

    #[test]
    fn splits_host_and_localpart() {
        assert_eq!(host("$abc:h1").unwrap(), "h1");
        assert_eq!(localpart("$abc:h1").unwrap(), "abc");
        assert_eq!(host("@a:example.org:8448").unwrap(), "example.org:8448");
        assert!(host("$abc").is_err());
    }

    #[test]
    fn build_round_trips() {
        let id = build(Sigil::Event, "xyz", "h");
        assert_eq!(id, "$xyz:h");
        assert!(valid(Sigil::Event, &id));
    }
}
