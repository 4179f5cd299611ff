//! Glob-style ignore patterns compiled into one matcher.

use regex::{Regex, RegexBuilder};

use crate::store::IndexStore;
use satchel_common::{Error, Result};

/// Case-insensitive matcher over the vault's ignore patterns.
///
/// `*` matches any run of characters and `?` exactly one; everything else is
/// literal. A pattern must match the whole path.
#[derive(Debug, Clone, Default)]
pub struct IgnoreMatcher {
    regex: Option<Regex>,
}

impl IgnoreMatcher {
    /// Compile the patterns currently stored in the index.
    pub fn reload(store: &IndexStore) -> Result<Self> {
        Self::from_patterns(store.list_ignore_patterns()?)
    }

    pub fn from_patterns<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let alternation = patterns
            .into_iter()
            .map(|pattern| glob_to_regex(pattern.as_ref()))
            .collect::<Vec<_>>()
            .join("|");

        if alternation.is_empty() {
            return Ok(Self::default());
        }

        let regex = RegexBuilder::new(&alternation)
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::InvalidInput(format!("Invalid ignore pattern: {e}")))?;
        Ok(Self { regex: Some(regex) })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.as_ref().is_some_and(|regex| regex.is_match(path))
    }

    pub fn is_empty(&self) -> bool {
        self.regex.is_none()
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let escaped = regex::escape(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");
    format!("^(?:{escaped})$")
}
