//! Availability states and the target/current presence pair.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::hooks::Hook;

/// Availability, ordered from most to least available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Online,
    Chat,
    Away,
    ExtendedAway,
    DoNotDisturb,
    Offline,
}

impl Presence {
    /// Value of the `<show/>` child, `None` for plain online and offline.
    pub fn show(self) -> Option<&'static str> {
        match self {
            Presence::Chat => Some("chat"),
            Presence::Away => Some("away"),
            Presence::ExtendedAway => Some("xa"),
            Presence::DoNotDisturb => Some("dnd"),
            Presence::Online | Presence::Offline => None,
        }
    }

    /// Derive presence from a stanza's `type` attribute and `<show/>` text.
    pub fn from_stanza(presence_type: Option<&str>, show: Option<&str>) -> Presence {
        if matches!(presence_type, Some("unavailable") | Some("unsubscribed")) {
            return Presence::Offline;
        }
        match show.map(str::trim) {
            None | Some("") => Presence::Online,
            Some("chat") => Presence::Chat,
            Some("away") => Presence::Away,
            Some("xa") => Presence::ExtendedAway,
            Some("dnd") => Presence::DoNotDisturb,
            Some(_) => Presence::Online,
        }
    }

    pub fn is_offline(self) -> bool {
        self == Presence::Offline
    }
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Presence::Online => "online",
            Presence::Chat => "chat",
            Presence::Away => "away",
            Presence::ExtendedAway => "xa",
            Presence::DoNotDisturb => "dnd",
            Presence::Offline => "offline",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceChange {
    pub target: Presence,
    pub previous: Presence,
}

/// Holds the presence the user asked for and the one last broadcast.
///
/// Only the connection layer moves `current`; callers move `target`.
pub struct PresenceController {
    state: Mutex<(Presence, Presence)>,
    target_changed: Hook<PresenceChange>,
}

impl PresenceController {
    pub fn new() -> Self {
        Self {
            state: Mutex::new((Presence::Offline, Presence::Offline)),
            target_changed: Hook::new(),
        }
    }

    pub fn target(&self) -> Presence {
        self.state.lock().0
    }

    pub fn current(&self) -> Presence {
        self.state.lock().1
    }

    pub fn set_target(&self, target: Presence) {
        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.0, target)
        };
        if previous != target {
            self.target_changed.emit(&PresenceChange { target, previous });
        }
    }

    pub(crate) fn set_current(&self, current: Presence) {
        self.state.lock().1 = current;
    }

    /// Fires when the target presence changes.
    pub fn on_target_changed(&self) -> &Hook<PresenceChange> {
        &self.target_changed
    }
}

impl Default for PresenceController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_ordering() {
        assert!(Presence::Online < Presence::Chat);
        assert!(Presence::Away < Presence::ExtendedAway);
        assert!(Presence::DoNotDisturb < Presence::Offline);
        assert_eq!(
            [Presence::Away, Presence::Online, Presence::Offline].iter().min(),
            Some(&Presence::Online)
        );
    }

    #[test]
    fn test_from_stanza() {
        assert_eq!(Presence::from_stanza(None, None), Presence::Online);
        assert_eq!(Presence::from_stanza(None, Some("xa")), Presence::ExtendedAway);
        assert_eq!(Presence::from_stanza(None, Some("dnd")), Presence::DoNotDisturb);
        assert_eq!(Presence::from_stanza(Some("unavailable"), Some("away")), Presence::Offline);
        assert_eq!(Presence::from_stanza(Some("unsubscribed"), None), Presence::Offline);
    }

    #[test]
    fn test_show_mapping() {
        assert_eq!(Presence::Online.show(), None);
        assert_eq!(Presence::ExtendedAway.show(), Some("xa"));
        assert_eq!(Presence::from_stanza(None, Presence::Away.show()), Presence::Away);
    }

    #[test]
    fn test_controller_target_and_current_are_independent() {
        let controller = PresenceController::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        controller.on_target_changed().subscribe(move |change: &PresenceChange| {
            assert_eq!(change.previous, Presence::Offline);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        controller.set_target(Presence::Away);
        controller.set_target(Presence::Away);
        assert_eq!(controller.target(), Presence::Away);
        assert_eq!(controller.current(), Presence::Offline);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        controller.set_current(Presence::Away);
        assert_eq!(controller.current(), Presence::Away);
    }
}
