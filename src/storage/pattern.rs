//! Glob-style key filters.
//!
//! `*` matches one or more characters, newlines included. Every other
//! character, including regex metacharacters, matches itself. The translated
//! expression is anchored to the whole key and starts with the `(?s)` flag,
//! which both the `regex` crate and `PostgreSQL` accept.

use std::fmt;

/// A key filter translated into a regular expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    regex: String,
}

impl Pattern {
    /// Translates a glob into an anchored regular expression.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use kvlock::Pattern;
    ///
    /// assert_eq!(Pattern::from_glob("job.*").as_regex(), r"(?s)^job\..+$");
    /// ```
    #[must_use]
    pub fn from_glob(glob: &str) -> Self {
        let body = glob
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".+");

        Self {
            regex: format!("(?s)^{body}$"),
        }
    }

    /// Returns the regular expression.
    #[must_use]
    pub fn as_regex(&self) -> &str {
        &self.regex
    }

    /// Returns the expression as a quoted SQL string literal.
    ///
    /// Single quotes are doubled so the literal cannot terminate early.
    #[must_use]
    pub fn sql_literal(&self) -> String {
        format!("'{}'", self.regex.replace('\'', "''"))
    }

    /// Tests a key against the pattern locally.
    ///
    /// Backends evaluate patterns in SQL; this is the same rule applied in
    /// process.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        regex::Regex::new(&self.regex).is_ok_and(|re| re.is_match(key))
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.regex)
    }
}
