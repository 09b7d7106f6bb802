//! Import policy engine.
//!
//! Module names are judged by their top-level segment. A curated slice of
//! the runtime's standard library is always importable; every other name is
//! third-party and must be on the caller's whitelist. The engine only
//! answers questions: it never installs or loads anything.

use std::collections::BTreeSet;

/// Standard-library modules scripts may import without whitelisting,
/// sorted. Host access (`os`, `sys` internals, `io`, `importlib`, ...) and
/// modules that build unbounded buffers from one argument (`struct`,
/// `array`, `zlib`) are left out.
pub const STANDARD_LIBRARY: &[&str] = &[
    "abc",
    "base64",
    "binascii",
    "bisect",
    "calendar",
    "cmath",
    "collections",
    "colorsys",
    "copy",
    "dataclasses",
    "datetime",
    "decimal",
    "difflib",
    "enum",
    "fractions",
    "functools",
    "hashlib",
    "heapq",
    "html",
    "itertools",
    "json",
    "keyword",
    "math",
    "numbers",
    "random",
    "re",
    "statistics",
    "string",
    "sys",
    "textwrap",
    "time",
    "traceback",
    "unicodedata",
];

/// How the policy classifies a module name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportClass {
    /// Bundled with the runtime; importable without whitelisting.
    StandardLibrary,
    /// Not bundled, but declared by the caller.
    ThirdParty,
    /// Not bundled and not declared.
    Disallowed,
}

/// The whitelist of one session, fixed when the session is configured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportPolicy {
    additional: BTreeSet<String>,
}

/// Top-level package of a dotted module path.
pub fn top_level(name: &str) -> &str {
    name.split('.').next().unwrap_or(name).trim()
}

impl ImportPolicy {
    pub fn new<I, S>(additional: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            additional: additional
                .into_iter()
                .map(|m| top_level(m.as_ref()).to_string())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    /// Parses the comma-separated `ADDITIONAL_IMPORTS` knob.
    pub fn from_csv(list: &str) -> Self {
        Self::new(Self::parse_list(list))
    }

    /// Splits a comma-separated list, trimming entries and dropping empty ones.
    pub fn parse_list(list: &str) -> Vec<String> {
        list.split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn is_standard_library(name: &str) -> bool {
        STANDARD_LIBRARY.binary_search(&top_level(name)).is_ok()
    }

    pub fn classify(&self, name: &str) -> ImportClass {
        let top = top_level(name);
        if Self::is_standard_library(top) {
            ImportClass::StandardLibrary
        } else if self.additional.contains(top) {
            ImportClass::ThirdParty
        } else {
            ImportClass::Disallowed
        }
    }

    /// Whether `import name` may proceed. Near-miss names are not corrected.
    pub fn is_allowed(&self, name: &str) -> bool {
        self.classify(name) != ImportClass::Disallowed
    }

    /// Splits names into (standard library, third-party) for the
    /// provisioning layer, which installs the latter out of band.
    pub fn partition<I, S>(names: I) -> (Vec<String>, Vec<String>)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .map(|n| n.as_ref().trim().to_string())
            .filter(|n| !n.is_empty())
            .partition(|n| Self::is_standard_library(n))
    }

    /// Third-party names declared by the caller, sorted.
    pub fn additional_imports(&self) -> impl Iterator<Item = &str> {
        self.additional.iter().map(String::as_str)
    }

    /// The effective whitelist (standard library plus declared ones), sorted.
    pub fn allowed_modules(&self) -> Vec<String> {
        let mut all: BTreeSet<String> = STANDARD_LIBRARY.iter().map(|m| m.to_string()).collect();
        all.extend(self.additional.iter().cloned());
        all.into_iter().collect()
    }

    /// Message of the `ImportError` raised for a rejected import.
    pub fn violation_message(&self, name: &str) -> String {
        let allowed: Vec<String> = self.allowed_modules().iter().map(|m| format!("'{m}'")).collect();
        format!(
            "Import of '{name}' is not allowed. Allowed modules: [{}]",
            allowed.join(", ")
        )
    }
}
