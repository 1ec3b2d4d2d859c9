// Copyright (c) 2023-2025 The Mesh Foundation

//! The Coordinator is, at any time, in one of three states:
//!
//! AcceptingManifest: fresh instance waiting for the operator to upload a
//! policy. AcceptingMarbles: policy installed, marbles may activate and
//! admins may update the policy. Recovery: sealed state could not be
//! unsealed at startup; only an authorized recovery-key holder can restore
//! the instance.
//!
//! AcceptingManifest -> AcceptingMarbles on a successful set_manifest.
//! Recovery -> AcceptingMarbles on a successful recover.

use displaydoc::Display;
use serde::{Deserialize, Serialize};

/// Which phase of its lifecycle the Coordinator is in.
#[derive(Copy, Clone, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
pub enum State {
    /// accepting manifest
    AcceptingManifest,
    /// accepting marbles
    AcceptingMarbles,
    /// recovery
    Recovery,
}

impl State {
    /// Numeric status code reported over the client API.
    pub fn code(&self) -> i64 {
        match self {
            State::AcceptingManifest => 1,
            State::AcceptingMarbles => 2,
            State::Recovery => 3,
        }
    }

    /// Human-readable status text, non-empty in every state.
    pub fn text(&self) -> &'static str {
        match self {
            State::AcceptingManifest => {
                "Coordinator is ready to accept a manifest"
            }
            State::AcceptingMarbles => {
                "Coordinator is running and accepting marble activations"
            }
            State::Recovery => {
                "Coordinator failed to unseal its state and requires recovery"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct_and_stable() {
        assert_eq!(State::AcceptingManifest.code(), 1);
        assert_eq!(State::AcceptingMarbles.code(), 2);
        assert_eq!(State::Recovery.code(), 3);
    }

    #[test]
    fn status_text_is_never_empty() {
        for state in [
            State::AcceptingManifest,
            State::AcceptingMarbles,
            State::Recovery,
        ] {
            assert!(!state.text().is_empty());
        }
    }

    #[test]
    fn state_serde_round_trip() {
        for state in [
            State::AcceptingManifest,
            State::AcceptingMarbles,
            State::Recovery,
        ] {
            let encoded = serde_json::to_string(&state).unwrap();
            let decoded: State = serde_json::from_str(&encoded).unwrap();
            assert_eq!(state, decoded);
        }
    }
}
