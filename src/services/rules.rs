//! Deterministic pre-filters applied before any model call.
//!
//! Rules run in a fixed order and the first match decides:
//!
//! 1. Whitelisted sender
//! 2. Several organisation addresses in To and Cc
//!
//! They never touch the network.

use regex::Regex;

use crate::config::ClassificationSettings;
use crate::domain::{ClassificationResult, DecidedBy, StoredMessage};

#[derive(Debug, Clone)]
enum Pattern {
    /// Bare domain matched as a substring of the address.
    Substring(String),
    /// `*` glob, searched anywhere in the address.
    Glob(Regex),
}

/// Sender whitelist built from configured patterns.
#[derive(Debug, Clone, Default)]
pub struct WhitelistMatcher {
    patterns: Vec<Pattern>,
}

impl WhitelistMatcher {
    /// Compiles patterns. Matching is case-insensitive and a leading `@` is ignored.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|raw| {
                let pattern = raw.as_ref().trim().to_lowercase();
                let pattern = pattern.strip_prefix('@').unwrap_or(&pattern);
                if pattern.is_empty() {
                    return None;
                }
                if !pattern.contains('*') {
                    return Some(Pattern::Substring(pattern.to_string()));
                }
                let source = regex::escape(pattern).replace(r"\*", ".*");
                match Regex::new(&source) {
                    Ok(re) => Some(Pattern::Glob(re)),
                    Err(e) => {
                        tracing::warn!(pattern, error = %e, "ignoring whitelist pattern");
                        None
                    }
                }
            })
            .collect();
        Self { patterns }
    }

    /// Whether the sender address matches any pattern.
    pub fn matches(&self, sender: &str) -> bool {
        let sender = sender.to_lowercase();
        self.patterns.iter().any(|pattern| match pattern {
            Pattern::Substring(domain) => sender.contains(domain.as_str()),
            Pattern::Glob(re) => re.is_match(&sender),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// The rule set with its target labels.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    whitelist: WhitelistMatcher,
    whitelist_label: String,
    in_copy_label: String,
    organization_domain: String,
}

impl RuleEngine {
    pub fn new(
        whitelist: WhitelistMatcher,
        whitelist_label: impl Into<String>,
        in_copy_label: impl Into<String>,
        organization_domain: &str,
    ) -> Self {
        Self {
            whitelist,
            whitelist_label: whitelist_label.into(),
            in_copy_label: in_copy_label.into(),
            organization_domain: normalize_domain(organization_domain),
        }
    }

    pub fn from_settings(settings: &ClassificationSettings) -> Self {
        Self::new(
            WhitelistMatcher::new(&settings.whitelist_patterns),
            settings.whitelist_label.clone(),
            settings.in_copy_label.clone(),
            &settings.organization_domain,
        )
    }

    /// Addresses in To and Cc belonging to the organisation.
    pub fn internal_recipients(&self, message: &StoredMessage) -> usize {
        if self.organization_domain.is_empty() {
            return 0;
        }
        message
            .to
            .iter()
            .chain(message.cc.iter())
            .filter(|addr| addr.domain().as_deref() == Some(self.organization_domain.as_str()))
            .count()
    }

    /// The rule decision for a message, if any rule fires.
    pub fn evaluate(&self, message: &StoredMessage) -> Option<ClassificationResult> {
        if self.whitelist.matches(&message.from.email) {
            return Some(ClassificationResult::from_rule(
                message.id.clone(),
                self.whitelist_label.clone(),
                format!("Sender {} is whitelisted", message.from.email),
                DecidedBy::RuleWhitelist,
            ));
        }

        let internal = self.internal_recipients(message);
        if internal > 1 {
            return Some(ClassificationResult::from_rule(
                message.id.clone(),
                self.in_copy_label.clone(),
                format!(
                    "{} recipients at @{} in To/Cc",
                    internal, self.organization_domain
                ),
                DecidedBy::RuleMultipleRecipients,
            ));
        }

        None
    }
}

fn normalize_domain(domain: &str) -> String {
    let domain = domain.trim().to_ascii_lowercase();
    domain.strip_prefix('@').unwrap_or(&domain).to_string()
}
