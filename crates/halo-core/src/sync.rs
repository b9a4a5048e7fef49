use std::path::Path;

/// Result of validating a plugin directory against its canonical remote
/// copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncOutcome {
    pub verified: bool,
    pub detail: String,
}

impl SyncOutcome {
    pub fn verified(detail: impl Into<String>) -> Self {
        Self {
            verified: true,
            detail: detail.into(),
        }
    }

    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            verified: false,
            detail: detail.into(),
        }
    }
}

/// External plugin-sync collaborator. Installation and version sync happen
/// elsewhere; discovery only consumes the verdict.
pub trait BundleSync: Send + Sync {
    fn verify(&self, name: &str, path: &Path) -> SyncOutcome;

    /// Repair-then-verify, used by dev-mode discovery when plain
    /// verification fails.
    fn force_verify(&self, name: &str, path: &Path) -> SyncOutcome {
        self.verify(name, path)
    }
}

/// Trusts every local directory; the deployment without a remote catalog.
pub struct TrustedLocalSync;

impl BundleSync for TrustedLocalSync {
    fn verify(&self, _name: &str, path: &Path) -> SyncOutcome {
        if path.is_dir() {
            SyncOutcome::verified("local bundle trusted")
        } else {
            SyncOutcome::rejected("bundle directory missing")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trusted_sync_accepts_existing_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outcome = TrustedLocalSync.verify("demo", dir.path());
        assert!(outcome.verified);

        let missing = dir.path().join("absent");
        let outcome = TrustedLocalSync.verify("demo", &missing);
        assert!(!outcome.verified);
    }
}
