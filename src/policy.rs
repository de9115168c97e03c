//! SSH access policy types and evaluation.
//!
//! A policy is an ordered list of rules. Evaluation walks the rules in
//! order and returns the first rule whose principal set matches the
//! connection's mesh identity and whose `ssh_users` mapping resolves the
//! requested SSH username to a non-empty local account (reject rules are
//! exempt from the mapping requirement). Later rules never shadow earlier
//! ones.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::action::SshAction;
use crate::conn::ConnInfo;

/// The centrally distributed SSH policy: an ordered sequence of rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshPolicy {
    #[serde(default)]
    pub rules: Vec<SshRule>,
}

/// One policy rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshRule {
    /// Expiry instant; an expired rule is skipped.
    #[serde(default)]
    pub rule_expires: Option<DateTime<Utc>>,
    /// Who this rule applies to. A rule with no principals matches nobody.
    #[serde(default)]
    pub principals: Vec<SshPrincipal>,
    /// Requested SSH username -> local account. `"*"` is a fallback key,
    /// the value `"="` means "use the requested name verbatim".
    #[serde(default)]
    pub ssh_users: HashMap<String, String>,
    /// The action to take; a rule with no action is skipped.
    #[serde(default)]
    pub action: Option<SshAction>,
    /// Environment variable patterns the session may accept from the
    /// client (`*` and `?` wildcards).
    #[serde(default)]
    pub accept_env: Vec<String>,
}

/// One way a rule can match a mesh identity. Empty fields do not match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshPrincipal {
    /// Stable node ID.
    #[serde(default)]
    pub node: String,
    /// Source mesh IP address.
    #[serde(default)]
    pub node_ip: String,
    /// Login name of the user behind the node.
    #[serde(default)]
    pub user_login: String,
    /// Matches any identity.
    #[serde(default)]
    pub any: bool,
}

/// The outcome of a successful rule match.
#[derive(Debug, Clone)]
pub struct PolicyMatch {
    pub action: SshAction,
    pub local_user: String,
    pub accept_env: Vec<String>,
}

/// Why a rule was skipped. Internal; never shown to the client.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum RuleSkip {
    #[error("nil action")]
    NilAction,
    #[error("rule expired")]
    Expired,
    #[error("principal didn't match")]
    PrincipalMismatch,
    #[error("user didn't match")]
    UserMismatch,
}

/// Evaluate `pol` against `info` at time `now`, returning the first match.
pub fn evaluate(pol: &SshPolicy, info: &ConnInfo, now: DateTime<Utc>) -> Option<PolicyMatch> {
    for rule in &pol.rules {
        match match_rule(rule, info, now) {
            Ok(m) => return Some(m),
            Err(skip) => debug!(reason = %skip, "rule skipped"),
        }
    }
    None
}

fn match_rule(rule: &SshRule, info: &ConnInfo, now: DateTime<Utc>) -> Result<PolicyMatch, RuleSkip> {
    let Some(action) = &rule.action else {
        return Err(RuleSkip::NilAction);
    };
    if rule_expired(rule, now) {
        return Err(RuleSkip::Expired);
    }
    // For all but reject rules a usable local-user mapping is required. A
    // reject needs no local account to be meaningful, so a reject rule with
    // no ssh_users is accepted and applied.
    let mut local_user = String::new();
    if !action.reject {
        local_user = map_local_user(&rule.ssh_users, &info.ssh_user);
        if local_user.is_empty() {
            return Err(RuleSkip::UserMismatch);
        }
    }
    if !any_principal_matches(&rule.principals, info) {
        return Err(RuleSkip::PrincipalMismatch);
    }
    Ok(PolicyMatch {
        action: action.clone(),
        local_user,
        accept_env: rule.accept_env.clone(),
    })
}

fn rule_expired(rule: &SshRule, now: DateTime<Utc>) -> bool {
    match rule.rule_expires {
        Some(expires) => expires < now,
        None => false,
    }
}

/// Map the requested SSH username through a rule's `ssh_users` table.
/// Returns an empty string when the table yields no account.
pub fn map_local_user(ssh_users: &HashMap<String, String>, requested: &str) -> String {
    let v = ssh_users
        .get(requested)
        .or_else(|| ssh_users.get("*"))
        .cloned()
        .unwrap_or_default();
    if v == "=" {
        requested.to_string()
    } else {
        v
    }
}

fn any_principal_matches(principals: &[SshPrincipal], info: &ConnInfo) -> bool {
    principals.iter().any(|p| principal_matches(p, info))
}

/// Reports whether one of the principal's four identity fields matches.
pub fn principal_matches(p: &SshPrincipal, info: &ConnInfo) -> bool {
    if p.any {
        return true;
    }
    if !p.node.is_empty() && p.node == info.node.stable_id {
        return true;
    }
    if !p.node_ip.is_empty() {
        if let Ok(ip) = p.node_ip.parse::<std::net::IpAddr>() {
            if ip == info.src.ip() {
                return true;
            }
        }
    }
    if !p.user_login.is_empty() && p.user_login == info.uprof.login_name {
        return true;
    }
    false
}

/// Reports whether env var `name` matches any of the accept-env patterns.
/// Patterns support `*` (any run) and `?` (any single character).
pub fn env_accepted(patterns: &[String], name: &str) -> bool {
    patterns.iter().any(|p| glob_match(p, name))
}

fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    glob_match_at(&p, &n)
}

fn glob_match_at(p: &[char], n: &[char]) -> bool {
    match (p.first(), n.first()) {
        (None, None) => true,
        (Some('*'), _) => {
            // Star matches zero characters, or one-and-recurse.
            glob_match_at(&p[1..], n) || (!n.is_empty() && glob_match_at(p, &n[1..]))
        }
        (Some('?'), Some(_)) => glob_match_at(&p[1..], &n[1..]),
        (Some(pc), Some(nc)) if pc == nc => glob_match_at(&p[1..], &n[1..]),
        _ => false,
    }
}
