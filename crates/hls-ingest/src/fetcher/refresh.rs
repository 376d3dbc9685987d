//! Media playlist reload cadence.

use std::time::Duration;

/// Back-off state of the reload timer. Every reload that returns an
/// unchanged playlist moves one step further; a changed one resets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum RefreshState {
    #[default]
    Initial,
    FirstUnchanged,
    SecondUnchanged,
    ThirdUnchanged,
}

impl RefreshState {
    /// Minimum playlist age before the next reload.
    ///
    /// `last_segment` is the duration of the newest segment, which is how
    /// long a live playlist normally takes to gain one.
    pub fn min_playlist_age(self, target_duration: Duration, last_segment: Duration) -> Duration {
        match self {
            Self::Initial => last_segment,
            Self::FirstUnchanged => target_duration / 2,
            Self::SecondUnchanged => target_duration * 3 / 2,
            Self::ThirdUnchanged => target_duration * 3,
        }
    }

    pub fn on_reload(self, changed: bool) -> Self {
        if changed {
            return Self::Initial;
        }
        match self {
            Self::Initial => Self::FirstUnchanged,
            Self::FirstUnchanged => Self::SecondUnchanged,
            Self::SecondUnchanged | Self::ThirdUnchanged => Self::ThirdUnchanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backs_off_while_unchanged() {
        let td = Duration::from_secs(6);
        let seg = Duration::from_secs(4);
        let mut state = RefreshState::default();
        assert_eq!(state.min_playlist_age(td, seg), seg);

        let mut ages = Vec::new();
        for _ in 0..4 {
            state = state.on_reload(false);
            ages.push(state.min_playlist_age(td, seg).as_secs_f64());
        }
        assert_eq!(ages, vec![3.0, 9.0, 18.0, 18.0]);

        assert_eq!(state.on_reload(true), RefreshState::Initial);
    }
}
