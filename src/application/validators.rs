use validator::ValidateLength;

/// Validates a provider-side identifier such as a customer id (`cus_...`).
/// Rules:
/// - 1-255 characters
/// - Printable ASCII only, no whitespace
pub fn is_valid_provider_id(id: &str) -> bool {
    id.validate_length(Some(1), Some(255), None) && id.chars().all(|c| c.is_ascii_graphic())
}

/// Validates a free-text operator note on a dead letter item.
pub fn is_valid_operator_note(note: &str) -> bool {
    let note = note.trim();
    note.validate_length(Some(1), Some(2000), None)
}

/// Validates the operator handle recorded next to a note.
pub fn is_valid_operator(operator: &str) -> bool {
    let operator = operator.trim();
    operator.validate_length(Some(1), Some(100), None)
        && !operator.chars().any(|c| c.is_control())
}
