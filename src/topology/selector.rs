/// Server selection over topology snapshots
use crate::core::{Endpoint, ServerDescription, ServerRole};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Where reads may be served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPreference {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl FromStr for ReadPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "primary" => Ok(ReadPreference::Primary),
            "primarypreferred" => Ok(ReadPreference::PrimaryPreferred),
            "secondary" => Ok(ReadPreference::Secondary),
            "secondarypreferred" => Ok(ReadPreference::SecondaryPreferred),
            "nearest" => Ok(ReadPreference::Nearest),
            _ => Err(format!("unknown read preference '{}'", s)),
        }
    }
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadPreference::Primary => write!(f, "primary"),
            ReadPreference::PrimaryPreferred => write!(f, "primaryPreferred"),
            ReadPreference::Secondary => write!(f, "secondary"),
            ReadPreference::SecondaryPreferred => write!(f, "secondaryPreferred"),
            ReadPreference::Nearest => write!(f, "nearest"),
        }
    }
}

/// What an operation needs from the server it runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionCriteria {
    Write,
    Read(ReadPreference),
}

impl fmt::Display for SelectionCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionCriteria::Write => write!(f, "writable server"),
            SelectionCriteria::Read(preference) => write!(f, "read ({})", preference),
        }
    }
}

/// Server selection algorithm trait
pub trait ServerSelector: Send + Sync {
    /// Pick an endpoint from a snapshot, or `None` if nothing qualifies
    fn select(
        &self,
        servers: &[ServerDescription],
        criteria: &SelectionCriteria,
    ) -> Option<Endpoint>;
}

/// Lowest observed round-trip time among suitable connected servers
///
/// Ties break on endpoint ordering so the choice is deterministic.
#[derive(Debug, Default)]
pub struct LowestLatency;

impl LowestLatency {
    fn fastest<F>(servers: &[ServerDescription], suitable: F) -> Option<Endpoint>
    where
        F: Fn(ServerRole) -> bool,
    {
        servers
            .iter()
            .filter(|server| server.is_connected() && suitable(server.role))
            .min_by(|a, b| {
                let a_rtt = a.round_trip_time.unwrap_or(Duration::MAX);
                let b_rtt = b.round_trip_time.unwrap_or(Duration::MAX);
                a_rtt.cmp(&b_rtt).then_with(|| a.endpoint.cmp(&b.endpoint))
            })
            .map(|server| server.endpoint.clone())
    }
}

impl ServerSelector for LowestLatency {
    fn select(
        &self,
        servers: &[ServerDescription],
        criteria: &SelectionCriteria,
    ) -> Option<Endpoint> {
        // A standalone satisfies every read preference
        let writable = |role: ServerRole| role.is_writable();
        let secondary =
            |role: ServerRole| matches!(role, ServerRole::Secondary | ServerRole::Standalone);

        match criteria {
            SelectionCriteria::Write | SelectionCriteria::Read(ReadPreference::Primary) => {
                Self::fastest(servers, writable)
            }
            SelectionCriteria::Read(ReadPreference::PrimaryPreferred) => {
                Self::fastest(servers, writable).or_else(|| Self::fastest(servers, secondary))
            }
            SelectionCriteria::Read(ReadPreference::Secondary) => Self::fastest(servers, secondary),
            SelectionCriteria::Read(ReadPreference::SecondaryPreferred) => {
                Self::fastest(servers, secondary).or_else(|| Self::fastest(servers, writable))
            }
            SelectionCriteria::Read(ReadPreference::Nearest) => {
                Self::fastest(servers, |role| role.is_readable())
            }
        }
    }
}
