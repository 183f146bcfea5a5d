//! Claims and authorization mapping.
//!
//! A cryptographically valid assertion can still be refused here: given name
//! and surname are mandatory for this application.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::error::PolicyError;
use crate::saml::Assertion;
use crate::settings::{ClaimPolicy, RoleTable};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationResult {
    /// Raw group identifiers in IdP order, de-duplicated.
    pub groups: Vec<String>,
    /// Sorted role names. Unknown groups contribute nothing.
    pub roles: Vec<String>,
}

fn has_value(assertion: &Assertion, claim: &str) -> bool {
    assertion
        .attributes
        .get(claim)
        .is_some_and(|values| values.iter().any(|v| !v.trim().is_empty()))
}

pub fn map_claims(
    assertion: &Assertion,
    policy: &ClaimPolicy,
    roles: &RoleTable,
) -> Result<AuthorizationResult, PolicyError> {
    let missing: Vec<String> = [&policy.given_name, &policy.surname]
        .into_iter()
        .filter(|claim| !has_value(assertion, claim))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(PolicyError::MissingRequiredClaim { claims: missing });
    }

    let mut groups: Vec<String> = Vec::new();
    for group in assertion.attributes.get(&policy.groups).into_iter().flatten() {
        let group = group.trim();
        if !group.is_empty() && !groups.iter().any(|g| g == group) {
            groups.push(group.to_string());
        }
    }

    let role_set: BTreeSet<&str> = groups.iter().filter_map(|g| roles.role_for(g)).collect();
    let unmapped = groups.len() - groups.iter().filter(|g| roles.role_for(g).is_some()).count();

    debug!(
        groups = groups.len(),
        roles = role_set.len(),
        unmapped,
        "Mapped group claims to roles"
    );

    Ok(AuthorizationResult {
        roles: role_set.into_iter().map(str::to_string).collect(),
        groups,
    })
}
