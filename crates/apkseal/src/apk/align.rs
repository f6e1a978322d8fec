//! Entry alignment rules.
//!
//! An [`AlignmentRule`] maps an entry path to the byte boundary its data must
//! start on. Android maps uncompressed native libraries straight from the APK,
//! which requires page alignment; everything else only needs 4-byte alignment.

/// Suffix identifying native libraries.
pub const NATIVE_LIBRARY_SUFFIX: &str = ".so";

/// Alignment for native libraries (one memory page).
pub const NATIVE_LIBRARY_ALIGNMENT: u64 = 4096;

/// Alignment for all other entries.
pub const DEFAULT_ALIGNMENT: u64 = 4;

/// Alignment returned when no rule matches.
pub const NO_ALIGNMENT: u64 = 1;

/// Pure mapping from entry path to data alignment.
///
/// Rules compose: [`AlignmentRule::Compose`] asks each inner rule in order and
/// uses the first one that matches.
///
/// # Examples
///
/// ```
/// use apkseal::apk::AlignmentRule;
///
/// let rule = AlignmentRule::apk();
/// assert_eq!(rule.boundary("lib/arm64-v8a/libfoo.so"), 4096);
/// assert_eq!(rule.boundary("classes.dex"), 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlignmentRule {
    /// Every path gets the same alignment.
    Constant(u64),
    /// Paths ending in `suffix` get `alignment`; others do not match.
    Suffix {
        /// Path suffix, compared case-sensitively.
        suffix: String,
        /// Boundary for matching paths.
        alignment: u64,
    },
    /// First matching rule wins.
    Compose(Vec<AlignmentRule>),
}

impl AlignmentRule {
    /// The rule used for APKs: `.so` on 4096 bytes, everything else on 4.
    pub fn apk() -> Self {
        AlignmentRule::Compose(vec![
            AlignmentRule::Suffix {
                suffix: NATIVE_LIBRARY_SUFFIX.to_string(),
                alignment: NATIVE_LIBRARY_ALIGNMENT,
            },
            AlignmentRule::Constant(DEFAULT_ALIGNMENT),
        ])
    }

    /// Returns the alignment for `path` if this rule matches it.
    fn matching(&self, path: &str) -> Option<u64> {
        match self {
            AlignmentRule::Constant(alignment) => Some(*alignment),
            AlignmentRule::Suffix { suffix, alignment } => {
                path.ends_with(suffix.as_str()).then_some(*alignment)
            }
            AlignmentRule::Compose(rules) => rules.iter().find_map(|r| r.matching(path)),
        }
    }

    /// Returns the byte boundary the data of `path` must start on.
    ///
    /// Paths no rule matches, and rules that specify zero, get [`NO_ALIGNMENT`].
    #[must_use]
    pub fn boundary(&self, path: &str) -> u64 {
        self.matching(path)
            .filter(|alignment| *alignment > 0)
            .unwrap_or(NO_ALIGNMENT)
    }

    /// Whether `data_offset` satisfies the boundary for `path`.
    #[must_use]
    pub fn is_aligned(&self, path: &str, data_offset: u64) -> bool {
        data_offset % self.boundary(path) == 0
    }
}

impl Default for AlignmentRule {
    fn default() -> Self {
        Self::apk()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apk_rule() {
        let rule = AlignmentRule::apk();
        assert_eq!(rule.boundary("lib/armeabi-v7a/libnative.so"), 4096);
        assert_eq!(rule.boundary("classes.dex"), 4);
        assert_eq!(rule.boundary("res/raw/lib.so.txt"), 4);
        assert_eq!(rule.boundary("assets/libupper.SO"), 4);
    }

    #[test]
    fn test_compose_first_match_wins() {
        let rule = AlignmentRule::Compose(vec![
            AlignmentRule::Suffix {
                suffix: ".arsc".into(),
                alignment: 8,
            },
            AlignmentRule::Suffix {
                suffix: "resources.arsc".into(),
                alignment: 16,
            },
        ]);
        assert_eq!(rule.boundary("resources.arsc"), 8);
        assert_eq!(rule.boundary("classes.dex"), NO_ALIGNMENT);
    }

    #[test]
    fn test_zero_alignment_falls_back() {
        let rule = AlignmentRule::Constant(0);
        assert_eq!(rule.boundary("anything"), NO_ALIGNMENT);
        assert!(rule.is_aligned("anything", 7));
    }

    #[test]
    fn test_is_aligned() {
        let rule = AlignmentRule::apk();
        assert!(rule.is_aligned("lib/x86/libfoo.so", 8192));
        assert!(!rule.is_aligned("lib/x86/libfoo.so", 8196));
        assert!(rule.is_aligned("AndroidManifest.xml", 8196));
        assert!(!rule.is_aligned("AndroidManifest.xml", 8198));
    }
}
