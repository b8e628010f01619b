//! SQL predicates shared by memory queries and detectors

use crate::auth::Principal;

/// Conditions selecting active memories. The expiry condition binds
/// one `?` parameter: the current time in ISO form.
pub fn active_memory_conditions(alias: &str) -> Vec<String> {
    vec![
        format!("{a}.retracted_at IS NULL", a = alias),
        format!("{a}.superseded_at IS NULL", a = alias),
        format!("({a}.expires_at IS NULL OR {a}.expires_at > ?)", a = alias),
    ]
}

/// Sensitivity conditions for a caller; no condition for restricted access
pub fn sensitivity_conditions(principal: &Principal, alias: &str) -> Vec<String> {
    if principal.can_access_restricted {
        vec![]
    } else if principal.can_access_sensitive {
        vec![format!("{}.sensitivity != 'restricted'", alias)]
    } else {
        vec![format!("{}.sensitivity = 'normal'", alias)]
    }
}
