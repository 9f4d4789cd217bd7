//! Shared plumbing for string-labelled enums and their state machines.

use crate::error::TransitionError;

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum whose
/// variants are persisted as fixed labels.
macro_rules! labelled {
  ($ty:ident, $kind:literal, { $($variant:ident => $label:literal),+ $(,)? }) => {
    impl $ty {
      /// The persisted label of this variant.
      pub fn as_str(self) -> &'static str {
        match self {
          $(Self::$variant => $label,)+
        }
      }
    }

    impl std::fmt::Display for $ty {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
      }
    }

    impl std::str::FromStr for $ty {
      type Err = $crate::error::ParseLabelError;

      fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
          $($label => Ok(Self::$variant),)+
          other => Err($crate::error::ParseLabelError {
            kind: $kind,
            value: other.to_string(),
          }),
        }
      }
    }
  };
}

pub(crate) use labelled;

/// A lifecycle state with an explicit set of allowed transitions.
pub trait StateMachine: Copy + Eq + Sized {
  /// Entity name used in error messages.
  const ENTITY: &'static str;

  fn label(self) -> &'static str;

  /// Whether moving from `self` to `next` is allowed.
  fn allows(self, next: Self) -> bool;

  /// Validate a transition, returning the new state.
  fn transition(self, next: Self) -> Result<Self, TransitionError> {
    if self.allows(next) {
      Ok(next)
    } else {
      Err(TransitionError {
        entity: Self::ENTITY,
        from: self.label(),
        to: next.label(),
      })
    }
  }
}
