//! Domain adapter layer: outside-world activity signals for supervised sessions.
//!
//! No IO, no async. Products translate whatever they watch (media playback,
//! downloads, focused windows) into `SignalEvent`s; the supervisor routes them
//! to the matching `SignalObserver` of the session.

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use throttle_arbiter_core::PriorityLevel;

/// One activity report from the outside world.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignalEvent<'a> {
    /// Supervised session key.
    pub session_id: Cow<'a, str>,
    /// Observer name within that session.
    pub observer: Cow<'a, str>,
    pub active: bool,
}

impl<'a> SignalEvent<'a> {
    pub fn new(
        session_id: impl Into<Cow<'a, str>>,
        observer: impl Into<Cow<'a, str>>,
        active: bool,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            observer: observer.into(),
            active,
        }
    }

    pub fn activated(session_id: impl Into<Cow<'a, str>>, observer: impl Into<Cow<'a, str>>) -> Self {
        Self::new(session_id, observer, true)
    }

    pub fn deactivated(session_id: impl Into<Cow<'a, str>>, observer: impl Into<Cow<'a, str>>) -> Self {
        Self::new(session_id, observer, false)
    }

    pub fn into_owned(self) -> SignalEvent<'static> {
        SignalEvent {
            session_id: Cow::Owned(self.session_id.into_owned()),
            observer: Cow::Owned(self.observer.into_owned()),
            active: self.active,
        }
    }
}

/// Declares one observer of a session: its name and the tier it requests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserverSpec {
    pub name: String,
    pub level: PriorityLevel,
}

impl ObserverSpec {
    pub fn new(name: impl Into<String>, level: PriorityLevel) -> Self {
        Self {
            name: name.into(),
            level,
        }
    }
}

/// Group events by session, keeping input order within each session.
/// Sessions come out sorted by id.
pub fn group_by_session<'e, 'a>(
    events: &'e [SignalEvent<'a>],
) -> BTreeMap<&'e str, Vec<&'e SignalEvent<'a>>> {
    let mut out: BTreeMap<&str, Vec<&SignalEvent<'a>>> = BTreeMap::new();
    for ev in events {
        out.entry(ev.session_id.as_ref()).or_default().push(ev);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouping_is_sorted_and_order_preserving() {
        let events = vec![
            SignalEvent::activated("s2", "media"),
            SignalEvent::activated("s1", "download"),
            SignalEvent::deactivated("s2", "media"),
        ];
        let groups = group_by_session(&events);
        let keys: Vec<_> = groups.keys().copied().collect();
        assert_eq!(keys, vec!["s1", "s2"]);
        let s2: Vec<bool> = groups["s2"].iter().map(|e| e.active).collect();
        assert_eq!(s2, vec![true, false]);
    }
}
