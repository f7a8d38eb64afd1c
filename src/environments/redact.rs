const MASK: &str = "*****";

/// Display form of a secret value: `<EMPTY>`, a bare mask, or its first three characters and a mask
pub fn redact(value: &str) -> String {
    if value.is_empty() {
        return "<EMPTY>".to_string();
    }
    if value.chars().count() <= 3 {
        return MASK.to_string();
    }
    let prefix: String = value.chars().take(3).collect();
    format!("{}{}", prefix, MASK)
}
