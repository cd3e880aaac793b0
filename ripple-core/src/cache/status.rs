//! Cache entry status and its transition table.

use std::fmt;

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Created, never loaded.
    New,
    /// A load is in flight.
    Loading,
    /// A fresh value is available.
    Loaded,
    /// The last load failed. No value.
    Error,
    /// Past its freshness window, still observed.
    Stale,
    /// Past its freshness window, unobserved. Waiting for deletion.
    StaleOffscreen,
    /// Removed from the cache. Terminal.
    Deleted,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::New => "New",
            Status::Loading => "Loading",
            Status::Loaded => "Loaded",
            Status::Error => "Error",
            Status::Stale => "Stale",
            Status::StaleOffscreen => "StaleOffscreen",
            Status::Deleted => "Deleted",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (New, Loading)
                | (New, Deleted)
                | (Loading, Loaded)
                | (Loading, Error)
                | (Loading, Loading)
                | (Loading, StaleOffscreen)
                | (Loaded, Stale)
                | (Loaded, StaleOffscreen)
                | (Loaded, Loading)
                | (Stale, Loading)
                | (Stale, StaleOffscreen)
                | (StaleOffscreen, Stale)
                | (StaleOffscreen, Loading)
                | (StaleOffscreen, Deleted)
                | (Error, Loading)
                | (Error, StaleOffscreen)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == Status::Deleted
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Status; 7] = [
        Status::New,
        Status::Loading,
        Status::Loaded,
        Status::Error,
        Status::Stale,
        Status::StaleOffscreen,
        Status::Deleted,
    ];

    #[test]
    fn deleted_is_terminal() {
        for next in ALL {
            assert!(!Status::Deleted.can_transition_to(next));
        }
        assert!(Status::Deleted.is_terminal());
    }

    #[test]
    fn loaded_never_skips_to_deleted() {
        assert!(!Status::Loaded.can_transition_to(Status::Deleted));
        assert!(Status::Loaded.can_transition_to(Status::Stale));
        assert!(Status::Loaded.can_transition_to(Status::StaleOffscreen));
    }

    #[test]
    fn only_offscreen_and_new_entries_can_be_deleted() {
        let deletable: Vec<Status> = ALL.into_iter().filter(|s| s.can_transition_to(Status::Deleted)).collect();
        assert_eq!(deletable, vec![Status::New, Status::StaleOffscreen]);
    }

    #[test]
    fn names_match_subscriber_status_strings() {
        assert_eq!(Status::StaleOffscreen.to_string(), "StaleOffscreen");
        assert_eq!(Status::Loading.as_str(), "Loading");
    }
}
