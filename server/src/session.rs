//! Per-player session state
//!
//! A session ties one simulated entity to the source of its controls. The
//! snapshot a peer had seen travels with each of its controls, see
//! [`crate::input::PacedControl`].

use crate::input::{ControlScript, InputController};
use shared::{EntityId, PeerId};

#[derive(Debug)]
pub struct Session {
    /// `None` for scripted sessions
    pub peer: Option<PeerId>,
    pub entity: EntityId,
    pub controller: InputController,
    /// Whether snapshots are sent to this session
    pub ready: bool,
}

impl Session {
    pub fn network(peer: PeerId, entity: EntityId) -> Self {
        Self::new(Some(peer), entity, InputController::network())
    }

    pub fn scripted(entity: EntityId, script: impl ControlScript + 'static) -> Self {
        let mut session = Self::new(None, entity, InputController::scripted(script));
        session.ready = true;
        session
    }

    fn new(peer: Option<PeerId>, entity: EntityId, controller: InputController) -> Self {
        Self {
            peer,
            entity,
            controller,
            ready: false,
        }
    }

    pub fn is_scripted(&self) -> bool {
        self.controller.is_scripted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::control::Control;

    #[test]
    fn test_network_session_waits_for_ready() {
        let session = Session::network(1, 10);
        assert!(!session.ready);
        assert!(!session.is_scripted());
        assert_eq!(session.peer, Some(1));
    }

    #[test]
    fn test_scripted_session_is_ready() {
        let session = Session::scripted(3, |_: &shared::snapshot::EntityDesc, tick| Control::new(tick));
        assert!(session.ready);
        assert!(session.is_scripted());
        assert_eq!(session.peer, None);
    }
}
