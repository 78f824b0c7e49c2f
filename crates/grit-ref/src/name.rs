//! Ref name validation.

use std::fmt;

use crate::RefError;

/// A validated ref name: `HEAD` or something under `refs/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefName(String);

/// Bytes never allowed anywhere in a ref name.
const FORBIDDEN: &[u8] = b" ~^:?*[\\";

impl RefName {
    /// Validate and wrap a full ref name.
    ///
    /// The rules follow `git check-ref-format` for full names: no leading
    /// or trailing `/`, no `..`, no `@{`, no control characters or
    /// `~^:?*[\`, no component starting with `.` or ending in `.lock`,
    /// and the name must be `HEAD` or start with `refs/`. Non-ASCII UTF-8
    /// is fine.
    pub fn new(name: impl Into<String>) -> Result<Self, RefError> {
        let name = name.into();
        Self::check(&name).map_err(|reason| RefError::InvalidName {
            name: name.clone(),
            reason,
        })?;
        Ok(Self(name))
    }

    /// Wrap without validation; for names read back from our own storage.
    pub(crate) fn new_unchecked(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    fn check(name: &str) -> Result<(), String> {
        if name.is_empty() {
            return Err("empty name".into());
        }
        if name != "HEAD" && !name.starts_with("refs/") {
            return Err("must be HEAD or start with refs/".into());
        }
        if name.starts_with('/') || name.ends_with('/') {
            return Err("leading or trailing slash".into());
        }
        if name.contains("..") {
            return Err("contains '..'".into());
        }
        if name.contains("@{") {
            return Err("contains '@{'".into());
        }
        for &b in name.as_bytes() {
            if b < 0x20 || b == 0x7f {
                return Err("contains a control character".into());
            }
            if FORBIDDEN.contains(&b) {
                return Err(format!("contains forbidden character {:?}", b as char));
            }
        }
        for component in name.split('/') {
            if component.is_empty() {
                return Err("empty component".into());
            }
            if component.starts_with('.') {
                return Err("component starts with '.'".into());
            }
            if component.ends_with(".lock") {
                return Err("component ends with '.lock'".into());
            }
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The short human form: `refs/heads/main` -> `main`.
    pub fn shorthand(&self) -> &str {
        self.0
            .strip_prefix("refs/heads/")
            .or_else(|| self.0.strip_prefix("refs/tags/"))
            .or_else(|| self.0.strip_prefix("refs/remotes/"))
            .unwrap_or(&self.0)
    }

    pub fn is_branch(&self) -> bool {
        self.0.starts_with("refs/heads/")
    }

    pub fn is_tag(&self) -> bool {
        self.0.starts_with("refs/tags/")
    }
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for RefName {
    type Err = RefError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for RefName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(name: &str) {
        assert!(RefName::new(name).is_ok(), "{name:?} should be accepted");
    }

    fn bad(name: &str) {
        assert!(RefName::new(name).is_err(), "{name:?} should be rejected");
    }

    #[test]
    fn accepted_names() {
        ok("HEAD");
        ok("refs/heads/main");
        ok("refs/heads/feature/nested");
        ok("refs/tags/v1.0.0");
        ok("refs/remotes/origin/main");
        // Non-ASCII UTF-8 is explicitly allowed.
        ok("refs/heads/función");
        ok("refs/heads/日本語");
    }

    #[test]
    fn rejected_names() {
        bad("");
        bad("main"); // not HEAD, not refs/
        bad("refs/heads/main/");
        bad("/refs/heads/main");
        bad("refs//heads");
        bad("refs/heads/a..b");
        bad("refs/heads/a b");
        bad("refs/heads/a~b");
        bad("refs/heads/a^b");
        bad("refs/heads/a:b");
        bad("refs/heads/a?b");
        bad("refs/heads/a*b");
        bad("refs/heads/a[b");
        bad("refs/heads/a\\b");
        bad("refs/heads/a\x07b");
        bad("refs/heads/.hidden");
        bad("refs/heads/branch.lock");
        bad("refs/heads/a@{b");
    }

    #[test]
    fn boundary_names() {
        // ".lock" only rejected as a component suffix.
        ok("refs/heads/lock");
        ok("refs/heads/a.locked");
        // "." inside a component is fine, only a leading "." is not.
        ok("refs/heads/v1.2");
        // "@" alone is allowed, only "@{" is not.
        ok("refs/heads/a@b");
    }

    #[test]
    fn shorthand_strips_known_prefixes() {
        assert_eq!(RefName::new("refs/heads/main").unwrap().shorthand(), "main");
        assert_eq!(RefName::new("refs/tags/v1").unwrap().shorthand(), "v1");
        assert_eq!(RefName::new("HEAD").unwrap().shorthand(), "HEAD");
    }

    #[test]
    fn classification() {
        assert!(RefName::new("refs/heads/x").unwrap().is_branch());
        assert!(RefName::new("refs/tags/x").unwrap().is_tag());
        assert!(!RefName::new("HEAD").unwrap().is_branch());
    }
}
