//! Installer progress state machine.
//!
//! Strictly linear; each step event is only accepted in its predecessor
//! state:
//! ```text
//! Idle → BundleCreated → DiskCreated → RestoreImageLoaded
//!      → ConfigurationBuilt → Installing → Installed
//! ```

use statig::prelude::*;
use tracing::info;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Completion of one installer step.
#[derive(Debug, Clone)]
pub enum InstallEvent {
    BundleCreated,
    DiskCreated,
    RestoreImageLoaded,
    ConfigurationBuilt,
    InstallStarted,
    InstallFinished,
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

/// Shared storage for the installer machine. Counts accepted steps.
#[derive(Debug, Default)]
pub struct InstallMachine {
    pub completed_steps: usize,
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::idle()",
    state(derive(Debug, Clone, PartialEq, Eq))
)]
impl InstallMachine {
    #[state]
    fn idle(&mut self, event: &InstallEvent) -> Outcome<State> {
        match event {
            InstallEvent::BundleCreated => self.advance(State::bundle_created()),
            _ => Handled,
        }
    }

    #[state]
    fn bundle_created(&mut self, event: &InstallEvent) -> Outcome<State> {
        match event {
            InstallEvent::DiskCreated => self.advance(State::disk_created()),
            _ => Handled,
        }
    }

    #[state]
    fn disk_created(&mut self, event: &InstallEvent) -> Outcome<State> {
        match event {
            InstallEvent::RestoreImageLoaded => self.advance(State::restore_image_loaded()),
            _ => Handled,
        }
    }

    #[state]
    fn restore_image_loaded(&mut self, event: &InstallEvent) -> Outcome<State> {
        match event {
            InstallEvent::ConfigurationBuilt => self.advance(State::configuration_built()),
            _ => Handled,
        }
    }

    #[state]
    fn configuration_built(&mut self, event: &InstallEvent) -> Outcome<State> {
        match event {
            InstallEvent::InstallStarted => self.advance(State::installing()),
            _ => Handled,
        }
    }

    #[state]
    fn installing(&mut self, event: &InstallEvent) -> Outcome<State> {
        match event {
            InstallEvent::InstallFinished => self.advance(State::installed()),
            _ => Handled,
        }
    }

    /// Terminal.
    #[state]
    fn installed(&mut self, event: &InstallEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }
}

impl InstallMachine {
    fn advance(&mut self, next: State) -> Outcome<State> {
        self.completed_steps += 1;
        info!(target: "install", step = self.completed_steps, state = ?next, "installer advanced");
        Transition(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_the_linear_path() {
        let mut sm = InstallMachine::default().state_machine();
        let steps = [
            (InstallEvent::BundleCreated, State::bundle_created()),
            (InstallEvent::DiskCreated, State::disk_created()),
            (InstallEvent::RestoreImageLoaded, State::restore_image_loaded()),
            (InstallEvent::ConfigurationBuilt, State::configuration_built()),
            (InstallEvent::InstallStarted, State::installing()),
            (InstallEvent::InstallFinished, State::installed()),
        ];
        for (event, expected) in steps {
            sm.handle(&event);
            assert_eq!(sm.state(), &expected);
        }
    }

    #[test]
    fn ignores_out_of_order_events() {
        let mut sm = InstallMachine::default().state_machine();
        sm.handle(&InstallEvent::DiskCreated);
        assert_eq!(sm.state(), &State::idle());

        sm.handle(&InstallEvent::BundleCreated);
        sm.handle(&InstallEvent::InstallFinished);
        assert_eq!(sm.state(), &State::bundle_created());
    }
}
