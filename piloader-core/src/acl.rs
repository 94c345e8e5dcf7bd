// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! IP based access control lists.
//!
//! An ACL is an ordered set of `(pattern, level)` pairs where the pattern is
//! a dotted quad with `*` allowed per octet. Lookups resolve a concrete
//! client address to the level of the best matching pattern, or -1 when
//! nothing matches. Patterns are evaluated in descending lexicographic
//! order, so fully numeric patterns win over wildcards sharing a prefix.

use crate::error::CoreError;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Manager for IP address ACL entries with memoized lookups.
pub struct IpAclManager {
    min_level: i32,
    max_level: i32,
    /// pattern -> level, sorted by pattern string
    entries: BTreeMap<String, i32>,
    /// pattern -> compiled matcher
    matchers: HashMap<String, Regex>,
    /// resolved ip -> level, cleared on every mutation
    known_ips: Mutex<HashMap<String, i32>>,
    /// file the ACL was loaded from, used for write back
    filename: Option<PathBuf>,
}

/// Shape of a single `IP,LEVEL` entry; the level range is checked separately.
fn entry_pattern() -> Regex {
    Regex::new(r"^([\d*]{1,3}\.){3}[\d*]{1,3}$").expect("static regex")
}

impl IpAclManager {
    /// Create an empty manager accepting levels in `[min_level, max_level]`.
    pub fn new(min_level: i32, max_level: i32) -> Result<Self, CoreError> {
        if min_level < 0 {
            return Err(CoreError::Acl("min_level must be 0 or more".into()));
        }
        if max_level > 9 {
            return Err(CoreError::Acl("max_level maximum is 9".into()));
        }
        if min_level > max_level {
            return Err(CoreError::Acl("min_level is bigger than max_level".into()));
        }
        Ok(Self {
            min_level,
            max_level,
            entries: BTreeMap::new(),
            matchers: HashMap::new(),
            known_ips: Mutex::new(HashMap::new()),
            filename: None,
        })
    }

    pub fn min_level(&self) -> i32 {
        self.min_level
    }

    pub fn max_level(&self) -> i32 {
        self.max_level
    }

    /// Path of the file the ACL was loaded from, if any.
    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    /// Load a whitespace separated list of `IP,LEVEL` entries.
    ///
    /// The load is all-or-nothing: on any ill-formed entry the previous
    /// state is left untouched.
    pub fn load(&mut self, text: &str) -> Result<(), CoreError> {
        let ip_re = entry_pattern();
        let mut entries = BTreeMap::new();
        let mut matchers = HashMap::new();

        for item in text.split_whitespace() {
            let (ip, level) = item.split_once(',').ok_or_else(|| {
                CoreError::Acl(format!("acl format is not okay - 1.2.3.4,0 5.6.7.8,1: '{item}'"))
            })?;
            if !ip_re.is_match(ip) {
                return Err(CoreError::Acl(format!("invalid ip pattern '{ip}'")));
            }
            let level: i32 = level
                .parse()
                .map_err(|_| CoreError::Acl(format!("invalid level '{level}'")))?;
            if level < self.min_level || level > self.max_level {
                return Err(CoreError::Acl(format!(
                    "level {} out of range {}..{}",
                    level, self.min_level, self.max_level
                )));
            }
            matchers.insert(ip.to_string(), compile_pattern(ip)?);
            entries.insert(ip.to_string(), level);
        }

        self.entries = entries;
        self.matchers = matchers;
        self.known_ips.lock().unwrap().clear();
        Ok(())
    }

    /// Load ACL entries from a file, one entry per non-comment line.
    ///
    /// `#` starts a comment. The path is remembered for [`write_file`].
    ///
    /// [`write_file`]: IpAclManager::write_file
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<(), CoreError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let mut text = String::new();
        for line in raw.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if !line.is_empty() {
                text.push_str(line);
                text.push(' ');
            }
        }
        self.load(text.trim())?;
        self.filename = Some(path.to_path_buf());
        Ok(())
    }

    /// Resolve a client address to its ACL level, or -1 when nothing matches.
    ///
    /// Results are memoized per address until the next mutating call.
    pub fn level_of(&self, ip: &str) -> i32 {
        if let Some(level) = self.known_ips.lock().unwrap().get(ip) {
            return *level;
        }

        for (pattern, level) in self.entries.iter().rev() {
            if self.matchers[pattern].is_match(ip) {
                self.known_ips.lock().unwrap().insert(ip.to_string(), *level);
                return *level;
            }
        }
        -1
    }

    /// Serialize the sorted entries to a file with a header comment.
    ///
    /// Uses the remembered load path when `path` is `None`. The replace is
    /// atomic (temp file + rename).
    pub fn write_file(
        &mut self,
        path: Option<&Path>,
        acl_name: Option<&str>,
    ) -> Result<(), CoreError> {
        let path = match path.or(self.filename.as_deref()) {
            Some(p) => p.to_path_buf(),
            None => return Err(CoreError::Acl("no acl file name known".into())),
        };

        let mut buff = format!(
            "# {}Access Control List (acl)\n# One entry per Line IPADRESS,LEVEL\n#\n",
            acl_name.map(|n| format!("{n} ")).unwrap_or_default()
        );
        for (ip, level) in &self.entries {
            buff.push_str(&format!("{ip},{level}\n"));
        }

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, buff)?;
        fs::rename(&tmp, &path)?;
        self.filename = Some(path);
        Ok(())
    }

    /// Canonical `IP,LEVEL IP,LEVEL ...` form of the ACL, sorted by pattern.
    pub fn acl_string(&self) -> String {
        self.entries
            .iter()
            .map(|(ip, level)| format!("{ip},{level}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Regex accepting a full ACL string within this manager's level range.
    ///
    /// Used by the configuration update validation table.
    pub fn regex_acl(&self) -> String {
        format!(
            r"(([\d\*]{{1,3}}\.){{3}}[\d\*]{{1,3}},[{}-{}] ?)*",
            self.min_level, self.max_level
        )
    }

    /// Iterate sorted `(pattern, level)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i32)> {
        self.entries.iter().map(|(ip, level)| (ip.as_str(), *level))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Compile a dotted-quad wildcard pattern into an anchored matcher.
fn compile_pattern(pattern: &str) -> Result<Regex, CoreError> {
    let escaped = pattern.replace('.', r"\.").replace('*', r"\d{1,3}");
    Regex::new(&format!("^{escaped}$"))
        .map_err(|e| CoreError::Acl(format!("invalid pattern '{pattern}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_manager_matches_nothing() {
        let mgr = IpAclManager::new(0, 4).unwrap();
        assert_eq!(mgr.level_of("127.0.0.1"), -1);
    }

    #[test]
    fn invalid_ranges_are_rejected() {
        assert!(IpAclManager::new(-1, 4).is_err());
        assert!(IpAclManager::new(0, 10).is_err());
        assert!(IpAclManager::new(4, 2).is_err());
    }

    #[rstest]
    #[case("127.0.0.1", 1)]
    #[case("192.168.1.50", 0)]
    #[case("192.168.2.50", -1)]
    #[case("10.0.0.1", -1)]
    fn lookup_resolves_wildcards(#[case] ip: &str, #[case] expected: i32) {
        let mut mgr = IpAclManager::new(0, 1).unwrap();
        mgr.load("127.0.0.1,1 192.168.1.*,0").unwrap();
        assert_eq!(mgr.level_of(ip), expected);
    }

    #[test]
    fn numeric_pattern_wins_over_wildcard() {
        let mut mgr = IpAclManager::new(0, 4).unwrap();
        mgr.load("192.168.1.*,1 192.168.1.10,4").unwrap();
        assert_eq!(mgr.level_of("192.168.1.10"), 4);
        assert_eq!(mgr.level_of("192.168.1.11"), 1);
    }

    #[test]
    fn lookup_is_memoized_and_stable() {
        let mut mgr = IpAclManager::new(0, 4).unwrap();
        mgr.load("10.*.*.*,2").unwrap();
        assert_eq!(mgr.level_of("10.1.2.3"), 2);
        assert_eq!(mgr.level_of("10.1.2.3"), 2);

        // Mutation invalidates the memo
        mgr.load("10.*.*.*,3").unwrap();
        assert_eq!(mgr.level_of("10.1.2.3"), 3);
    }

    #[test]
    fn failed_load_keeps_previous_state() {
        let mut mgr = IpAclManager::new(0, 4).unwrap();
        mgr.load("127.0.0.1,4").unwrap();

        assert!(mgr.load("127.0.0.1,9").is_err());
        assert!(mgr.load("not-an-ip,1").is_err());
        assert!(mgr.load("127.0.0.1").is_err());
        assert_eq!(mgr.level_of("127.0.0.1"), 4);
    }

    #[test]
    fn levels_stay_inside_configured_range() {
        let mut mgr = IpAclManager::new(0, 1).unwrap();
        assert!(mgr.load("1.2.3.4,2").is_err());
        mgr.load("1.2.3.4,1 5.6.7.8,0").unwrap();
        for ip in ["1.2.3.4", "5.6.7.8", "9.9.9.9"] {
            let level = mgr.level_of(ip);
            assert!(level == -1 || (0..=1).contains(&level));
        }
    }

    #[test]
    fn file_roundtrip_with_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acl.conf");
        std::fs::write(
            &path,
            "# header comment\n127.0.0.1,4\n192.168.1.*,2 # trailing comment\n\n",
        )
        .unwrap();

        let mut mgr = IpAclManager::new(0, 4).unwrap();
        mgr.load_file(&path).unwrap();
        assert_eq!(mgr.level_of("127.0.0.1"), 4);
        assert_eq!(mgr.level_of("192.168.1.9"), 2);
        assert_eq!(mgr.filename(), Some(path.as_path()));

        mgr.write_file(None, Some("XML-RPC")).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("# XML-RPC Access Control List"));
        assert!(written.contains("127.0.0.1,4\n"));
        assert!(written.contains("192.168.1.*,2\n"));

        let mut reread = IpAclManager::new(0, 4).unwrap();
        reread.load_file(&path).unwrap();
        assert_eq!(reread.acl_string(), mgr.acl_string());
    }

    #[test]
    fn duplicate_patterns_collapse_to_last() {
        let mut mgr = IpAclManager::new(0, 4).unwrap();
        mgr.load("1.2.3.4,1 1.2.3.4,3").unwrap();
        assert_eq!(mgr.level_of("1.2.3.4"), 3);
        assert_eq!(mgr.acl_string(), "1.2.3.4,3");
    }
}
