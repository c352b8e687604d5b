/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Connection lifecycle state.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle phase of the connection to the analysis server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverState {
    /// No server process.
    Disconnected,
    /// Process spawned, waiting for the server to report readiness.
    Connecting,
    /// Server ready to handle requests.
    Connected,
    /// Startup failed or the server went away without being asked to.
    Error,
}

impl DriverState {
    /// Create from atomic u8 value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Error,
        }
    }

    /// Convert to atomic u8 value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Error => 3,
        }
    }

    /// Whether `next` is a legal successor of this state.
    ///
    /// Disconnecting is always allowed; everything else follows
    /// `Disconnected -> Connecting -> Connected` with `Error` reachable from
    /// the two live states.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (_, Self::Disconnected)
                | (Self::Disconnected, Self::Connecting)
                | (Self::Connecting, Self::Connected | Self::Error)
                | (Self::Connected, Self::Error)
        )
    }

    /// True for `Connecting` and `Connected`.
    #[must_use]
    pub const fn is_on(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    /// Lowercase name, as shown in status output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free holder for a [`DriverState`], shared with reader tasks.
#[derive(Debug)]
pub struct AtomicDriverState(AtomicU8);

impl Default for AtomicDriverState {
    fn default() -> Self {
        Self::new(DriverState::Disconnected)
    }
}

impl AtomicDriverState {
    /// Creates a holder starting at `state`.
    #[must_use]
    pub const fn new(state: DriverState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    /// Current state.
    pub fn load(&self) -> DriverState {
        DriverState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Unconditionally replaces the state, returning the previous one.
    pub fn store(&self, state: DriverState) -> DriverState {
        DriverState::from_u8(self.0.swap(state.as_u8(), Ordering::SeqCst))
    }

    /// Moves to `next` only if the transition is legal from the current
    /// state. Returns the previous state on success.
    pub fn transition(&self, next: DriverState) -> Option<DriverState> {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                DriverState::from_u8(current)
                    .can_transition_to(next)
                    .then_some(next.as_u8())
            })
            .ok()
            .map(DriverState::from_u8)
    }

    /// Moves from exactly `from` to `to`. Returns whether the swap happened.
    pub fn compare_and_set(&self, from: DriverState, to: DriverState) -> bool {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_state_conversion() {
        assert_eq!(DriverState::from_u8(0), DriverState::Disconnected);
        assert_eq!(DriverState::from_u8(1), DriverState::Connecting);
        assert_eq!(DriverState::from_u8(2), DriverState::Connected);
        assert_eq!(DriverState::from_u8(3), DriverState::Error);
        assert_eq!(DriverState::from_u8(42), DriverState::Error);

        assert_eq!(DriverState::Disconnected.as_u8(), 0);
        assert_eq!(DriverState::Connecting.as_u8(), 1);
        assert_eq!(DriverState::Connected.as_u8(), 2);
        assert_eq!(DriverState::Error.as_u8(), 3);
    }

    #[test]
    fn test_legal_transitions() {
        use DriverState::{Connected, Connecting, Disconnected, Error};

        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Error));
        assert!(Connected.can_transition_to(Error));
        assert!(Error.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Disconnected));

        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Error.can_transition_to(Connecting));
        assert!(!Connected.can_transition_to(Connecting));
    }

    #[test]
    fn test_atomic_transition_rejects_illegal_moves() {
        let state = AtomicDriverState::default();
        assert_eq!(state.transition(DriverState::Connected), None);
        assert_eq!(state.load(), DriverState::Disconnected);

        assert_eq!(
            state.transition(DriverState::Connecting),
            Some(DriverState::Disconnected)
        );
        assert!(state.compare_and_set(DriverState::Connecting, DriverState::Connected));
        assert!(!state.compare_and_set(DriverState::Connecting, DriverState::Connected));
        assert_eq!(state.load(), DriverState::Connected);
    }

    #[test]
    fn test_is_on() {
        assert!(DriverState::Connecting.is_on());
        assert!(DriverState::Connected.is_on());
        assert!(!DriverState::Disconnected.is_on());
        assert!(!DriverState::Error.is_on());
    }
}
