//! Process-matching rule engine.
//!
//! Rules are ordered and matching is first-hit. A rule whose tunnel is not
//! currently up is skipped at match time ("live failover"); the reserved
//! direct id counts as always up. Matchers are compiled once when the rule
//! set is replaced, so the per-packet path is comparisons only.

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use splitroute_model::{FallbackAction, Rule, RulePriority, TunnelId};

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Invalid regex `{pattern}`")]
    BadRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("Invalid glob `{pattern}`")]
    BadGlob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

/// The outcome of a successful match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    /// Index of the hit, so `Failover` can resume from the next rule.
    pub index: usize,
    pub tunnel: Option<TunnelId>,
    pub fallback: FallbackAction,
    pub priority: RulePriority,
}

#[derive(Debug)]
enum Matcher {
    /// `regex:<expr>`, matched against the lowercased full path.
    Regex(regex::Regex),
    /// `C:\tools\*`: directory prefix, separator kept.
    DirPrefix(String),
    /// Contains a separator: full-path glob.
    Glob(glob::Pattern),
    /// Bare name: exact exe name or substring of the base name.
    Name(String),
}

impl Matcher {
    fn compile(pattern: &str) -> Result<Self, RuleError> {
        if let Some(expr) = pattern.strip_prefix("regex:") {
            let regex = regex::Regex::new(expr).map_err(|source| RuleError::BadRegex {
                pattern: pattern.to_owned(),
                source,
            })?;

            return Ok(Self::Regex(regex));
        }

        let lowered = pattern.to_lowercase();

        if let Some(prefix) = lowered.strip_suffix("\\*").or_else(|| lowered.strip_suffix("/*")) {
            // Keep the separator so `C:\tool` does not match `C:\toolbox`.
            return Ok(Self::DirPrefix(lowered[..prefix.len() + 1].to_owned()));
        }

        if lowered.contains('/') || lowered.contains('\\') {
            let glob = glob::Pattern::new(&lowered).map_err(|source| RuleError::BadGlob {
                pattern: pattern.to_owned(),
                source,
            })?;

            return Ok(Self::Glob(glob));
        }

        Ok(Self::Name(lowered))
    }

    fn matches(&self, path_lower: &str, base_lower: &str) -> bool {
        match self {
            Matcher::Regex(regex) => regex.is_match(path_lower),
            Matcher::DirPrefix(prefix) => path_lower.starts_with(prefix.as_str()),
            Matcher::Glob(glob) => glob.matches(path_lower),
            Matcher::Name(name) => base_lower == name || base_lower.contains(name.as_str()),
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    rule: Rule,
    matcher: Matcher,
}

pub struct RuleEngine {
    rules: RwLock<Vec<CompiledRule>>,
    /// Ids of tunnels currently up; swapped copy-on-write so the match path
    /// reads it without a lock. The direct sentinel is pinned in.
    active: ArcSwap<HashSet<TunnelId>>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    pub fn new() -> Self {
        let mut active = HashSet::new();
        active.insert(TunnelId::direct());

        Self {
            rules: RwLock::new(Vec::new()),
            active: ArcSwap::from_pointee(active),
        }
    }

    /// Replaces the whole rule set. Compilation failures leave the previous
    /// set in place.
    pub fn set_rules(&self, rules: Vec<Rule>) -> Result<(), RuleError> {
        let compiled = rules
            .into_iter()
            .map(|rule| {
                Ok(CompiledRule {
                    matcher: Matcher::compile(&rule.pattern)?,
                    rule,
                })
            })
            .collect::<Result<Vec<_>, RuleError>>()?;

        *self.rules.write() = compiled;

        Ok(())
    }

    /// Appends one rule at the end of the order.
    pub fn add_rule(&self, rule: Rule) -> Result<(), RuleError> {
        let compiled = CompiledRule {
            matcher: Matcher::compile(&rule.pattern)?,
            rule,
        };

        self.rules.write().push(compiled);

        Ok(())
    }

    /// Removes the rule at `index`; later rules shift up.
    pub fn remove_rule(&self, index: usize) -> Option<Rule> {
        let mut rules = self.rules.write();

        if index >= rules.len() {
            return None;
        }

        Some(rules.remove(index).rule)
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.rules.read().iter().map(|c| c.rule.clone()).collect()
    }

    /// Marks a tunnel as up/down for match-time live skip.
    pub fn set_active(&self, id: &TunnelId, active: bool) {
        if id.is_direct() {
            return;
        }

        let mut next = HashSet::clone(&self.active.load());
        let changed = if active {
            next.insert(id.clone())
        } else {
            next.remove(id)
        };

        if changed {
            self.active.store(Arc::new(next));
        }
    }

    pub fn is_active(&self, id: &TunnelId) -> bool {
        id.is_direct() || self.active.load().contains(id)
    }

    /// First-hit match over the whole rule set.
    pub fn match_exe(&self, path_lower: &str, base_lower: &str) -> Option<RuleMatch> {
        self.match_from(path_lower, base_lower, 0)
    }

    /// First-hit match starting at `start`; this is what `Failover` resumes
    /// with after a tunnel turned out to be unusable.
    pub fn match_from(
        &self,
        path_lower: &str,
        base_lower: &str,
        start: usize,
    ) -> Option<RuleMatch> {
        let active = self.active.load();
        let rules = self.rules.read();

        for (index, compiled) in rules.iter().enumerate().skip(start) {
            if !compiled.matcher.matches(path_lower, base_lower) {
                continue;
            }

            // Live skip: a rule pointing at a tunnel that is not up does
            // not count as a hit, so later rules get their turn.
            if let Some(tunnel) = &compiled.rule.tunnel
                && !tunnel.is_direct()
                && !active.contains(tunnel)
            {
                continue;
            }

            return Some(RuleMatch {
                index,
                tunnel: compiled.rule.tunnel.clone(),
                fallback: compiled.rule.fallback,
                priority: compiled.rule.priority,
            });
        }

        None
    }
}
