//! Lifecycle phases of a cache generation.

use color_eyre::{eyre::eyre, Result};
use std::fmt;

/// Phase of a controller, entered in order.
///
/// | Phase | Meaning |
/// |-------|---------|
/// | Parsed | Created, nothing cached yet |
/// | Installing | Populating the static store |
/// | Installed | Static store complete, waiting to take over |
/// | Activating | Purging stores of older generations |
/// | Activated | Intercepting fetches |
/// | Redundant | Failed install or superseded by a newer generation |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
  Redundant,
}

impl Phase {
  /// Whether moving from `self` to `next` is allowed.
  pub fn can_advance_to(self, next: Phase) -> bool {
    use Phase::*;

    match (self, next) {
      (Redundant, _) => false,
      (_, Redundant) => true,
      (Parsed, Installing)
      | (Installing, Installed)
      | (Installed, Activating)
      | (Activating, Activated) => true,
      _ => false,
    }
  }

  /// Move to `next`, rejecting out-of-order transitions.
  pub fn advance(&mut self, next: Phase) -> Result<()> {
    if !self.can_advance_to(next) {
      return Err(eyre!("Invalid lifecycle transition: {} -> {}", self, next));
    }
    *self = next;
    Ok(())
  }

  /// Whether fetches are intercepted in this phase.
  pub fn controls_fetches(self) -> bool {
    self == Phase::Activated
  }
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Phase::Parsed => "parsed",
      Phase::Installing => "installing",
      Phase::Installed => "installed",
      Phase::Activating => "activating",
      Phase::Activated => "activated",
      Phase::Redundant => "redundant",
    };
    f.write_str(name)
  }
}
