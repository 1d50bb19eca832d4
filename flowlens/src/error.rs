//! Typed errors for the capture, estimation and discovery paths.
//!
//! Each variant maps to one failure domain with its own handling policy:
//! attachment failures are fatal at startup, everything else is scoped to
//! the cycle that produced it.

/// Failure raised by one of the agent's core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Installing the tc classifier failed. Fatal.
    #[error("attach failed: {0}")]
    Attachment(String),

    /// Iterating the kernel flow table failed. The metrics cycle is skipped.
    #[error("harvest failed: {0}")]
    Harvest(String),

    /// Editing the monitored-port allow-list failed. Healed by the next sync.
    #[error("port sync failed: {0}")]
    Sync(String),

    /// The boot epoch could not be determined. The cycle publishes nothing.
    #[error("boot clock unavailable: {0}")]
    Clock(String),

    /// Enumerating game-server containers failed.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Invalid or unreadable configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Short variant name for structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Attachment(_) => "attachment",
            Error::Harvest(_) => "harvest",
            Error::Sync(_) => "sync",
            Error::Clock(_) => "clock",
            Error::Discovery(_) => "discovery",
            Error::Config(_) => "config",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(Error::Attachment("x".into()).kind(), "attachment");
        assert_eq!(Error::Harvest("x".into()).kind(), "harvest");
        assert_eq!(Error::Sync("x".into()).kind(), "sync");
        assert_eq!(Error::Clock("x".into()).kind(), "clock");
        assert_eq!(Error::Discovery("x".into()).kind(), "discovery");
        assert_eq!(Error::Config("x".into()).kind(), "config");
    }

    #[test]
    fn display_prefixes_domain() {
        let err = Error::Sync("failed to add port 27015: ENOSPC".into());
        assert_eq!(
            err.to_string(),
            "port sync failed: failed to add port 27015: ENOSPC"
        );
    }

    #[test]
    fn converts_into_anyhow() {
        let err: anyhow::Error = Error::Harvest("table gone".into()).into();
        assert!(err.to_string().contains("table gone"));
    }
}
