//! ACL policies and namespace rules

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A namespace-scoped capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Overrides every other capability on the namespace
    Deny,
    VolumeRead,
    VolumeCreate,
    VolumeMount,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Deny => "deny",
            Capability::VolumeRead => "volume-read",
            Capability::VolumeCreate => "volume-create",
            Capability::VolumeMount => "volume-mount",
        };
        f.write_str(s)
    }
}

/// Shorthand for a common capability set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyLevel {
    Read,
    Write,
    Deny,
}

impl PolicyLevel {
    pub fn capabilities(self) -> &'static [Capability] {
        match self {
            PolicyLevel::Read => &[Capability::VolumeRead],
            PolicyLevel::Write => &[
                Capability::VolumeRead,
                Capability::VolumeCreate,
                Capability::VolumeMount,
            ],
            PolicyLevel::Deny => &[Capability::Deny],
        }
    }
}

/// Capabilities granted on namespaces matching `name`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRule {
    /// Exact namespace, or a pattern where `*` matches any run of characters
    pub name: String,
    #[serde(default)]
    pub policy: Option<PolicyLevel>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl NamespaceRule {
    pub fn is_glob(&self) -> bool {
        self.name.contains('*')
    }

    /// The shorthand and explicit capabilities together
    pub fn expanded(&self) -> impl Iterator<Item = Capability> + '_ {
        self.policy
            .map(PolicyLevel::capabilities)
            .unwrap_or(&[])
            .iter()
            .copied()
            .chain(self.capabilities.iter().copied())
    }
}

/// A named set of rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub namespaces: Vec<NamespaceRule>,
    #[serde(default)]
    pub modify_index: u64,
}

impl Policy {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > 128 {
            return Err(Error::Validation(
                "policy name must be 1 to 128 characters".into(),
            ));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Validation(format!(
                "policy name {:?} may only contain letters, digits, '-' and '_'",
                self.name
            )));
        }
        for rule in &self.namespaces {
            if rule.name.is_empty() {
                return Err(Error::Validation(format!(
                    "policy {}: namespace rule without a name",
                    self.name
                )));
            }
            if rule.policy.is_none() && rule.capabilities.is_empty() {
                return Err(Error::Validation(format!(
                    "policy {}: rule for {} grants nothing",
                    self.name, rule.name
                )));
            }
        }
        Ok(())
    }
}

/// Match `name` against a pattern in which `*` stands for any run of characters
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if pi < p.len() && p[pi] == n[ni] {
            pi += 1;
            ni += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}
