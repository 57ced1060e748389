/// Monotonic snapshot versions with content-fingerprint deduplication.
///
/// Two consecutive captures of a logically unchanged page share a version;
/// `observe` reports whether the fingerprint is new so the caller can
/// short-circuit to a no-change response.
#[derive(Debug, Default)]
pub struct VersionManager {
    next: u64,
    last: Option<(String, u64)>,
}

impl VersionManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: 1,
            last: None,
        }
    }

    /// Record a capture's fingerprint. Returns `(version, is_new)`:
    /// `is_new = false` exactly when the fingerprint matches the prior
    /// version's, in which case the prior version is returned.
    pub fn observe(&mut self, fingerprint: &str) -> (u64, bool) {
        if let Some((last_fp, last_version)) = &self.last {
            if last_fp == fingerprint {
                return (*last_version, false);
            }
        }
        let version = self.next;
        self.next += 1;
        self.last = Some((fingerprint.to_owned(), version));
        (version, true)
    }

    /// The most recently assigned version.
    #[must_use]
    pub fn current(&self) -> Option<u64> {
        self.last.as_ref().map(|(_, v)| *v)
    }

    /// Reset for a full navigation: versions restart at 1.
    pub fn reset(&mut self) {
        self.next = 1;
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_monotonic_for_new_content() {
        let mut vm = VersionManager::new();
        assert_eq!(vm.observe("fp-a"), (1, true));
        assert_eq!(vm.observe("fp-b"), (2, true));
        assert_eq!(vm.observe("fp-c"), (3, true));
    }

    #[test]
    fn repeated_fingerprint_is_not_new() {
        let mut vm = VersionManager::new();
        assert_eq!(vm.observe("fp-a"), (1, true));
        assert_eq!(vm.observe("fp-a"), (1, false));
        assert_eq!(vm.observe("fp-a"), (1, false));
        // Content changes, then returns to the previous fingerprint: only
        // the immediately-prior version deduplicates.
        assert_eq!(vm.observe("fp-b"), (2, true));
        assert_eq!(vm.observe("fp-a"), (3, true));
    }

    #[test]
    fn reset_restarts_versions() {
        let mut vm = VersionManager::new();
        vm.observe("fp-a");
        vm.observe("fp-b");
        vm.reset();
        assert_eq!(vm.current(), None);
        assert_eq!(vm.observe("fp-b"), (1, true));
    }
}
