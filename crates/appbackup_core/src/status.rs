//! Status codes exchanged with the transport and reported to callers.

/// Closed set of statuses returned by transports and agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportStatus {
    /// Success.
    Ok,
    /// Generic transport failure.
    Error,
    /// The transport's storage has not been initialized (or was wiped).
    NotInitialized,
    /// The transport refuses this package.
    PackageRejected,
    /// The package exceeded its quota.
    QuotaExceeded,
    /// Agent-local failure; never returned by a transport.
    AgentError,
    /// Agent-local: the agent could not be found.
    AgentUnknown,
}

impl TransportStatus {
    /// Returns true for [`TransportStatus::Ok`].
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Returns true if the status only concerns the current package.
    #[must_use]
    pub const fn is_package_level(self) -> bool {
        matches!(self, Self::PackageRejected | Self::QuotaExceeded)
    }
}

/// Terminal result reported for one package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageOutcome {
    /// Data was stored or restored.
    Success,
    /// The package was excluded (policy, eligibility or transport refusal).
    Rejected,
    /// The package exceeded its quota.
    QuotaExceeded,
    /// The agent failed, timed out or misbehaved.
    AgentFailure,
    /// The package is not installed.
    NotFound,
}

/// Terminal status of a whole pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassStatus {
    /// The pass ran to completion.
    Ok,
    /// The transport failed; unfinished work was re-queued.
    TransportError,
    /// The pass was cancelled.
    Cancelled,
}

impl From<TransportStatus> for PassStatus {
    fn from(status: TransportStatus) -> Self {
        if status.is_ok() {
            Self::Ok
        } else {
            Self::TransportError
        }
    }
}
