//! Decides which method calls get a return edge

use core::fmt::{self, Debug};
use std::sync::Arc;

use crate::{instrumentor::InstrumentationMode, nothrow::NoThrowTable};

/// Claims classes that belong to the instrumentation itself.
///
/// Calls into these classes are never probed outside of testing, so the runtime does not
/// record coverage of itself.
pub trait SelfExclusion: Send + Sync {
    /// Whether `owner` (an internal class name) is part of the instrumentation
    fn is_excluded(&self, owner: &str) -> bool;
}

impl<F> SelfExclusion for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_excluded(&self, owner: &str) -> bool {
        self(owner)
    }
}

/// Excludes every class whose internal name starts with one of the prefixes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackagePrefixes(pub Vec<String>);

impl PackagePrefixes {
    /// Excludes the given packages, e.g. `libafl/jvm/`
    #[must_use]
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(prefixes.into_iter().map(Into::into).collect())
    }
}

impl SelfExclusion for PackagePrefixes {
    fn is_excluded(&self, owner: &str) -> bool {
        self.0.iter().any(|prefix| owner.starts_with(prefix.as_str()))
    }
}

/// Filters call sites: `needs_call_edge` holds for calls that may not return normally
pub struct CallSiteFilter {
    no_throw: Arc<NoThrowTable>,
    exclusion: Box<dyn SelfExclusion>,
    mode: InstrumentationMode,
}

impl Debug for CallSiteFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSiteFilter")
            .field("no_throw", &self.no_throw.len())
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Default for CallSiteFilter {
    fn default() -> Self {
        Self::new(
            Arc::new(NoThrowTable::new()),
            PackagePrefixes::default(),
            InstrumentationMode::Production,
        )
    }
}

impl CallSiteFilter {
    /// A filter over the given table and exclusion predicate
    pub fn new<E>(no_throw: Arc<NoThrowTable>, exclusion: E, mode: InstrumentationMode) -> Self
    where
        E: SelfExclusion + 'static,
    {
        Self {
            no_throw,
            exclusion: Box::new(exclusion),
            mode,
        }
    }

    /// The mode this filter was built for
    #[must_use]
    pub fn mode(&self) -> InstrumentationMode {
        self.mode
    }

    /// The no-throw table consulted
    #[must_use]
    pub fn no_throw(&self) -> &NoThrowTable {
        &self.no_throw
    }

    /// Whether a call to `owner.name descriptor` needs a probe right before it
    #[must_use]
    pub fn needs_call_edge(&self, owner: &str, name: &str, descriptor: &str) -> bool {
        if self.mode != InstrumentationMode::Testing && self.exclusion.is_excluded(owner) {
            return false;
        }
        !self.no_throw.contains(owner, name, descriptor)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        filter::{CallSiteFilter, PackagePrefixes},
        instrumentor::InstrumentationMode,
        nothrow::{NoThrowEntry, NoThrowTable},
    };

    fn table() -> Arc<NoThrowTable> {
        Arc::new(
            [NoThrowEntry::new("java/lang/Math", "abs", "(I)I")]
                .into_iter()
                .collect(),
        )
    }

    #[test]
    fn test_no_throw_is_skipped() {
        let filter = CallSiteFilter::new(
            table(),
            PackagePrefixes::new(["libafl/jvm/"]),
            InstrumentationMode::Production,
        );
        assert!(!filter.needs_call_edge("java/lang/Math", "abs", "(I)I"));
        assert!(filter.needs_call_edge("java/lang/Math", "abs", "(J)J"));
        assert!(filter.needs_call_edge("java/lang/Integer", "parseInt", "(Ljava/lang/String;)I"));
    }

    #[test]
    fn test_self_exclusion_only_outside_testing() {
        let production = CallSiteFilter::new(
            table(),
            |owner: &str| owner.starts_with("libafl/jvm/"),
            InstrumentationMode::Production,
        );
        assert!(!production.needs_call_edge("libafl/jvm/runtime/CoverageMap", "updated", "()V"));

        let testing = CallSiteFilter::new(
            table(),
            PackagePrefixes::new(["libafl/jvm/"]),
            InstrumentationMode::Testing,
        );
        assert!(testing.needs_call_edge("libafl/jvm/runtime/CoverageMap", "updated", "()V"));
        assert!(!testing.needs_call_edge("java/lang/Math", "abs", "(I)I"));
    }

    #[test]
    fn test_filter_is_pure() {
        let filter = CallSiteFilter::default();
        let first = filter.needs_call_edge("a/B", "c", "()V");
        for _ in 0..10 {
            assert_eq!(filter.needs_call_edge("a/B", "c", "()V"), first);
        }
    }
}
