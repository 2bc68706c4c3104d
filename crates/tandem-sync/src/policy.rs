//! Conflict rule for delayed mutation failures.

/// Decides whether a failed mutation may still restore its
/// pre-mutation snapshot after the remote result finally arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReconciliationPolicy {
    /// Restore only if nothing else landed on the key since this
    /// mutation's optimistic apply, i.e. the current version is
    /// exactly `base_version + 1`. A slow, failing mutation can then
    /// never clobber a newer successful one.
    #[default]
    VersionGated,
    /// Restore unconditionally. Under rare interleavings (a rollback
    /// racing a newer success) this loses the newer write; kept for
    /// comparison in tests.
    Always,
}

impl ReconciliationPolicy {
    /// Whether a rollback may be applied given the version captured
    /// before the optimistic apply and the key's current version.
    pub fn permits_rollback(&self, base_version: u64, current_version: u64) -> bool {
        match self {
            ReconciliationPolicy::VersionGated => current_version == base_version + 1,
            ReconciliationPolicy::Always => true,
        }
    }
}
