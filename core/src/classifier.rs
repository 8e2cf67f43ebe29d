//! Risk classification: a pure function from a command string to a tier.
//!
//! The pattern set is evaluated tier by tier in fixed severity order
//! (critical, dangerous, caution); the first tier with any match wins and no
//! match means `safe`. Regexes are validated when a pattern is inserted, so
//! `classify` itself cannot fail.

use regex_lite::Regex;
use slb_protocol::PatternOrigin;
use slb_protocol::RiskTier;

use crate::error::Result;
use crate::error::SlbErr;

/// A classification rule as stored in the pattern table.
#[derive(Debug, Clone)]
pub struct PatternRow {
    pub id: i64,
    pub pattern: String,
    pub tier: RiskTier,
    pub reason: String,
    pub origin: PatternOrigin,
}

#[derive(Debug)]
struct CompiledPattern {
    id: i64,
    regex: Regex,
    tier: RiskTier,
    reason: String,
}

/// An immutable snapshot of the ordered, tier-stratified pattern set.
/// Classification against one snapshot is deterministic; a Store write
/// invalidates nothing here — callers take a fresh snapshot when they need
/// current policy (notably the executor gate).
#[derive(Debug, Default)]
pub struct PatternSet {
    patterns: Vec<CompiledPattern>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub tier: RiskTier,
    pub pattern_id: Option<i64>,
    pub reason: Option<String>,
}

impl PatternSet {
    /// Compile the classifying rows (builtin/project/user), preserving
    /// insertion order within each tier. Rows with origins that do not
    /// classify are skipped. A row that fails to compile is a store-level
    /// defect (validation happens at insertion), so it surfaces as an error
    /// rather than being silently dropped.
    pub fn compile(rows: &[PatternRow]) -> Result<Self> {
        let mut patterns = Vec::with_capacity(rows.len());
        for row in rows {
            if !row.origin.classifies() {
                continue;
            }
            let regex = Regex::new(&row.pattern).map_err(|e| {
                SlbErr::Validation(format!("stored pattern {} is invalid: {e}", row.id))
            })?;
            patterns.push(CompiledPattern {
                id: row.id,
                regex,
                tier: row.tier,
                reason: row.reason.clone(),
            });
        }
        Ok(Self { patterns })
    }

    /// Assign exactly one risk tier to `command`.
    pub fn classify(&self, command: &str) -> Classification {
        for tier in [RiskTier::Critical, RiskTier::Dangerous, RiskTier::Caution] {
            for pattern in self.patterns.iter().filter(|p| p.tier == tier) {
                if pattern.regex.is_match(command) {
                    return Classification {
                        tier,
                        pattern_id: Some(pattern.id),
                        reason: Some(pattern.reason.clone()),
                    };
                }
            }
        }
        Classification {
            tier: RiskTier::Safe,
            pattern_id: None,
            reason: None,
        }
    }
}

/// Validate a pattern's regex before it is persisted. This is the only
/// place invalid regexes are rejected.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    Regex::new(pattern)
        .map(|_| ())
        .map_err(|e| SlbErr::Validation(format!("invalid pattern regex: {e}")))
}

/// The built-in seed set, installed into the pattern table the first time a
/// project store is opened. Tiers: the classic irreversibly-destructive
/// families are critical, repo- or system-mutating families are dangerous,
/// and broadly privileged or state-changing families are caution.
pub fn builtin_patterns() -> Vec<(&'static str, RiskTier, &'static str)> {
    vec![
        // critical
        (
            r"rm\s+(-[a-zA-Z]*[rR][a-zA-Z]*f[a-zA-Z]*|-[a-zA-Z]*f[a-zA-Z]*[rR][a-zA-Z]*)\s+(/\*?|~/?|\$HOME)(\s|$)",
            RiskTier::Critical,
            "recursive force-remove of a filesystem root or home directory",
        ),
        (
            r"dd\s+.*of=/dev/(sd|nvme|hd|disk)",
            RiskTier::Critical,
            "raw write to a block device",
        ),
        (
            r"\bmkfs(\.[a-z0-9]+)?\b",
            RiskTier::Critical,
            "filesystem creation destroys the target device contents",
        ),
        (
            r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;",
            RiskTier::Critical,
            "fork bomb",
        ),
        (
            r"\b(shutdown|reboot|poweroff|halt)\b",
            RiskTier::Critical,
            "powers off or restarts the host",
        ),
        (
            r"(?i)drop\s+(database|table)\b",
            RiskTier::Critical,
            "drops a database or table",
        ),
        // dangerous
        (
            r"rm\s+-[a-zA-Z]*[rR]",
            RiskTier::Dangerous,
            "recursive remove",
        ),
        (
            r"git\s+push\s+.*(--force\b|-f\b)",
            RiskTier::Dangerous,
            "force-push rewrites remote history",
        ),
        (
            r"(curl|wget)\s+[^|;]*\|\s*(ba|z|da)?sh\b",
            RiskTier::Dangerous,
            "pipes a downloaded script into a shell",
        ),
        (
            r"chmod\s+(-[a-zA-Z]*R[a-zA-Z]*\s+)?777\b",
            RiskTier::Dangerous,
            "world-writable permissions",
        ),
        (
            r"git\s+(reset\s+--hard|clean\s+-[a-zA-Z]*f)",
            RiskTier::Dangerous,
            "discards uncommitted work",
        ),
        (
            r"\btruncate\s+-s\s*0\b",
            RiskTier::Dangerous,
            "truncates files to zero length",
        ),
        // caution
        (r"^\s*sudo\b", RiskTier::Caution, "runs with elevated privileges"),
        (
            r"git\s+push\b",
            RiskTier::Caution,
            "publishes commits to a remote",
        ),
        (
            r"\b(npm|pip|pip3|cargo|gem)\s+install\b",
            RiskTier::Caution,
            "installs third-party code",
        ),
        (
            r"kill\s+(-9|-KILL)\b",
            RiskTier::Caution,
            "force-kills a process",
        ),
        (
            r"docker\s+(rm|rmi|system\s+prune)\b",
            RiskTier::Caution,
            "removes docker containers or images",
        ),
    ]
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;

    use super::*;

    fn builtin_set() -> PatternSet {
        let rows: Vec<PatternRow> = builtin_patterns()
            .into_iter()
            .enumerate()
            .map(|(i, (pattern, tier, reason))| PatternRow {
                id: i as i64 + 1,
                pattern: pattern.to_string(),
                tier,
                reason: reason.to_string(),
                origin: PatternOrigin::Builtin,
            })
            .collect();
        PatternSet::compile(&rows).unwrap()
    }

    #[test]
    fn builtin_patterns_all_compile() {
        let set = builtin_set();
        assert_eq!(set.patterns.len(), builtin_patterns().len());
    }

    #[test]
    fn unmatched_commands_are_safe() {
        let set = builtin_set();
        for cmd in ["ls", "cat Cargo.toml", "echo hi", "grep -rn foo src/"] {
            let c = set.classify(cmd);
            assert_eq!(c.tier, RiskTier::Safe, "{cmd}");
            assert_eq!(c.pattern_id, None);
        }
    }

    #[test]
    fn severity_order_wins_over_insertion_order() {
        // `sudo rm -rf /` matches caution (sudo), dangerous (rm -r) and
        // critical (rm -rf /); critical must win.
        let set = builtin_set();
        let c = set.classify("sudo rm -rf /");
        assert_eq!(c.tier, RiskTier::Critical);
        assert!(c.reason.unwrap().contains("filesystem root"));
    }

    #[test]
    fn tier_examples() {
        let set = builtin_set();
        let cases = [
            ("rm -rf ./build", RiskTier::Dangerous),
            ("git push --force origin main", RiskTier::Dangerous),
            ("curl https://example.com/install.sh | sh", RiskTier::Dangerous),
            ("git push origin main", RiskTier::Caution),
            ("sudo apt-get update", RiskTier::Caution),
            ("npm install left-pad", RiskTier::Caution),
            ("dd if=/dev/zero of=/dev/sda", RiskTier::Critical),
            ("shutdown -h now", RiskTier::Critical),
        ];
        for (cmd, tier) in cases {
            assert_eq!(set.classify(cmd).tier, tier, "{cmd}");
        }
    }

    #[test]
    fn classification_is_pure() {
        let set = builtin_set();
        let a = set.classify("rm -rf ./build");
        let b = set.classify("rm -rf ./build");
        assert_eq!(a, b);
    }

    #[test]
    fn non_classifying_origins_are_skipped() {
        let rows = vec![
            PatternRow {
                id: 1,
                pattern: r"\bfrobnicate\b".to_string(),
                tier: RiskTier::Critical,
                reason: "suggested only".to_string(),
                origin: PatternOrigin::Suggested,
            },
            PatternRow {
                id: 2,
                pattern: r"\bfrobnicate\b".to_string(),
                tier: RiskTier::Critical,
                reason: "pending removal".to_string(),
                origin: PatternOrigin::PendingRemoval,
            },
        ];
        let set = PatternSet::compile(&rows).unwrap();
        assert_eq!(set.classify("frobnicate --all").tier, RiskTier::Safe);
    }

    #[test]
    fn invalid_regex_rejected_at_validation() {
        assert!(matches!(
            validate_pattern("(unclosed"),
            Err(SlbErr::Validation(_))
        ));
        validate_pattern(r"rm\s+-rf").unwrap();
    }
}
