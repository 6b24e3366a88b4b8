//! Condition helpers for APIService status

use crate::APIService;

/// Condition type set once the backend of an APIService answers discovery
pub const AVAILABLE: &str = "Available";

/// Check whether the condition of the given type is present with status "True"
pub fn is_condition_true(api_service: &APIService, condition_type: &str) -> bool {
    api_service
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == condition_type && c.status == "True")
        })
        .unwrap_or(false)
}

/// Shorthand for the `Available` condition
pub fn is_available(api_service: &APIService) -> bool {
    is_condition_true(api_service, AVAILABLE)
}
