//! Dotted-version ordering for package receipts.
//!
//! Versions are split into runs of digits and runs of letters; separators
//! (`.`, `-`, `_`, `+`, whitespace) only delimit. Components compare
//! pairwise, numbers numerically and before any letters, and a version that
//! is a prefix of another is the lesser one. So `1.10 > 1.9`,
//! `2.0 < 2.0.1` and `1.0 < 1.0b1`.

use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Component {
    // Variant order matters: numbers sort before words.
    Number(u64),
    Word(String),
}

/// A version string parsed for comparison.
#[derive(Debug, Clone)]
pub struct DottedVersion {
    original: String,
    components: Vec<Component>,
}

impl DottedVersion {
    /// Version reported when a package has no receipt.
    pub const NOT_INSTALLED: &'static str = "0.0.0.0.0";

    pub fn parse(input: &str) -> Self {
        let mut components = Vec::new();
        let mut chars = input.trim().chars().peekable();

        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() {
                let mut digits = String::new();
                while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                    digits.push(d);
                    chars.next();
                }
                // Absurdly long digit runs saturate rather than fail.
                components.push(Component::Number(digits.parse().unwrap_or(u64::MAX)));
            } else if c.is_alphabetic() {
                let mut word = String::new();
                while let Some(&w) = chars.peek().filter(|w| w.is_alphabetic()) {
                    word.push(w.to_ascii_lowercase());
                    chars.next();
                }
                components.push(Component::Word(word));
            } else {
                chars.next();
            }
        }

        Self {
            original: input.to_string(),
            components,
        }
    }

}

impl PartialEq for DottedVersion {
    fn eq(&self, other: &Self) -> bool {
        self.components == other.components
    }
}

impl Eq for DottedVersion {}

impl PartialOrd for DottedVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DottedVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components.cmp(&other.components)
    }
}

impl fmt::Display for DottedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

/// True if `installed` already satisfies `wanted`.
pub fn is_satisfied(installed: &str, wanted: &str) -> bool {
    DottedVersion::parse(installed) >= DottedVersion::parse(wanted)
}
