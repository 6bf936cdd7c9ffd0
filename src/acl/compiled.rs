//! Compiled ACL: the merged capabilities of a token's policies

use super::policy::{glob_match, Capability, Policy};
use std::collections::{BTreeMap, BTreeSet};

type CapSet = BTreeSet<Capability>;

/// Capabilities of one resolved token
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acl {
    management: bool,
    exact: BTreeMap<String, CapSet>,
    globs: Vec<(String, CapSet)>,
}

impl Acl {
    /// An ACL that allows everything
    pub fn management() -> Self {
        Self {
            management: true,
            ..Default::default()
        }
    }

    /// Merge a set of policies. Rules for the same namespace pattern union;
    /// a `deny` on a pattern removes everything else granted on it.
    pub fn compile<'a>(policies: impl IntoIterator<Item = &'a Policy>) -> Self {
        let mut exact: BTreeMap<String, CapSet> = BTreeMap::new();
        let mut globs: BTreeMap<String, CapSet> = BTreeMap::new();

        for policy in policies {
            for rule in &policy.namespaces {
                let target = if rule.is_glob() {
                    globs.entry(rule.name.clone()).or_default()
                } else {
                    exact.entry(rule.name.clone()).or_default()
                };
                target.extend(rule.expanded());
            }
        }

        let squash = |caps: &mut CapSet| {
            if caps.contains(&Capability::Deny) {
                caps.retain(|c| *c == Capability::Deny);
            }
        };
        exact.values_mut().for_each(squash);
        globs.values_mut().for_each(squash);

        Self {
            management: false,
            exact,
            globs: globs.into_iter().collect(),
        }
    }

    pub fn is_management(&self) -> bool {
        self.management
    }

    /// Is `cap` allowed in `namespace`?
    pub fn allow_namespace_op(&self, namespace: &str, cap: Capability) -> bool {
        if self.management {
            return true;
        }
        match self.capabilities_for(namespace) {
            Some(caps) => !caps.contains(&Capability::Deny) && caps.contains(&cap),
            None => false,
        }
    }

    /// Is `cap` allowed in at least one namespace?
    pub fn allow_any_namespace(&self, cap: Capability) -> bool {
        if self.management {
            return true;
        }
        self.exact
            .values()
            .chain(self.globs.iter().map(|(_, caps)| caps))
            .any(|caps| caps.contains(&cap))
    }

    /// An exact rule wins; otherwise the matching glob with the most literal characters
    fn capabilities_for(&self, namespace: &str) -> Option<&CapSet> {
        if let Some(caps) = self.exact.get(namespace) {
            return Some(caps);
        }
        self.globs
            .iter()
            .filter(|(pattern, _)| glob_match(pattern, namespace))
            .max_by_key(|(pattern, _)| pattern.chars().filter(|c| *c != '*').count())
            .map(|(_, caps)| caps)
    }
}
