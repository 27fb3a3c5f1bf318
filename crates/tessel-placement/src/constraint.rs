//! Constraint matching against node properties.
//!
//! A constraint compares a left and right target with an operand. Targets
//! of the form `${...}` are interpolated from the node; anything else is a
//! literal.

use std::borrow::Cow;
use std::cmp::Ordering;

use regex::Regex;
use semver::{Version, VersionReq};
use tracing::warn;

use tessel_state::{Constraint, Node};

/// Resolve a constraint target against a node.
///
/// Returns `None` when an interpolated property is not set on the node.
pub fn resolve_target<'a>(target: &'a str, node: &'a Node) -> Option<Cow<'a, str>> {
    let Some(inner) = target
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    else {
        return Some(Cow::Borrowed(target));
    };

    match inner {
        "node.unique.id" => Some(Cow::Borrowed(node.id.as_str())),
        "node.unique.name" => Some(Cow::Borrowed(node.name.as_str())),
        "node.datacenter" => Some(Cow::Borrowed(node.datacenter.as_str())),
        "node.class" => Some(Cow::Borrowed(node.node_class.as_str())),
        _ => {
            if let Some(key) = inner.strip_prefix("attr.") {
                node.attributes.get(key).map(|v| Cow::Borrowed(v.as_str()))
            } else if let Some(key) = inner.strip_prefix("meta.") {
                node.meta.get(key).map(|v| Cow::Borrowed(v.as_str()))
            } else {
                None
            }
        }
    }
}

/// Check whether `node` satisfies `constraint`.
pub fn check_constraint(constraint: &Constraint, node: &Node) -> bool {
    let left = resolve_target(&constraint.l_target, node);

    match constraint.operand.as_str() {
        "is_set" => return left.is_some(),
        "is_not_set" => return left.is_none(),
        _ => {}
    }

    let right = resolve_target(&constraint.r_target, node);
    match (left, right) {
        (Some(l), Some(r)) => check_operand(&constraint.operand, &l, &r),
        _ => false,
    }
}

fn check_operand(operand: &str, left: &str, right: &str) -> bool {
    match operand {
        "=" | "==" | "is" => left == right,
        "!=" | "not" => left != right,
        "<" => compare(left, right) == Ordering::Less,
        "<=" => compare(left, right) != Ordering::Greater,
        ">" => compare(left, right) == Ordering::Greater,
        ">=" => compare(left, right) != Ordering::Less,
        "regexp" => match Regex::new(right) {
            Ok(re) => re.is_match(left),
            Err(e) => {
                warn!(pattern = %right, error = %e, "invalid regexp constraint");
                false
            }
        },
        "version" => check_version(left, right),
        "set_contains" => {
            let have = split_set(left);
            split_set(right).iter().all(|want| have.contains(want))
        }
        "set_contains_any" => {
            let have = split_set(left);
            split_set(right).iter().any(|want| have.contains(want))
        }
        other => {
            warn!(operand = %other, "unknown constraint operand");
            false
        }
    }
}

/// Numeric comparison when both sides parse as numbers, lexical otherwise.
fn compare(left: &str, right: &str) -> Ordering {
    match (left.trim().parse::<f64>(), right.trim().parse::<f64>()) {
        (Ok(l), Ok(r)) => l.partial_cmp(&r).unwrap_or(Ordering::Equal),
        _ => left.cmp(right),
    }
}

fn check_version(left: &str, requirement: &str) -> bool {
    let Some(version) = parse_version(left) else {
        return false;
    };
    match VersionReq::parse(requirement.trim()) {
        Ok(req) => req.matches(&version),
        Err(e) => {
            warn!(requirement = %requirement, error = %e, "invalid version constraint");
            false
        }
    }
}

/// Parse `v1.2`, `1.2`, `1` and full semver strings.
fn parse_version(raw: &str) -> Option<Version> {
    let trimmed = raw.trim().trim_start_matches('v');
    if let Ok(version) = Version::parse(trimmed) {
        return Some(version);
    }
    let mut parts: Vec<&str> = trimmed.split('.').collect();
    if parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&parts.join(".")).ok()
}

fn split_set(raw: &str) -> Vec<&str> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
