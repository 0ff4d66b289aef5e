//! POSIX path glob matching for exclusion patterns.
//!
//! Relative patterns match from the right (`*.ipynb` matches any notebook,
//! `drafts/*` matches files directly inside any `drafts` directory); absolute
//! patterns must match the whole path. `*` never crosses a `/`, `**` matches
//! any number of components.

use std::path::Path;

use globset::{Glob, GlobBuilder, GlobMatcher};

/// Compile `pattern` with the anchoring rules above.
pub fn compile_glob(pattern: &str) -> Result<GlobMatcher, globset::Error> {
    let pattern = pattern.trim_start_matches("./");
    let anchored = if pattern.starts_with('/') || pattern.starts_with("**/") {
        pattern.to_string()
    } else {
        format!("**/{pattern}")
    };
    GlobBuilder::new(&anchored)
        .literal_separator(true)
        .build()
        .map(|glob: Glob| glob.compile_matcher())
}

/// Whether `path` matches `pattern`. Invalid patterns match nothing.
pub fn path_matches(path: &Path, pattern: &str) -> bool {
    let path = path.to_string_lossy().replace('\\', "/");
    match compile_glob(pattern) {
        Ok(matcher) => matcher.is_match(path.as_str()),
        Err(e) => {
            tracing::debug!("Ignoring invalid glob {:?}: {}", pattern, e);
            false
        }
    }
}
