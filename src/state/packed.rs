//! Packed row encoding
//!
//! Rows in the object store and the local association index are ordered
//! vectors of string fields serialized as a JSON array. The encoding is
//! self-delimiting, so payload fields may themselves contain packed
//! rows.

/// Encode an ordered vector of string fields
pub fn pack(fields: &[String]) -> String {
    serde_json::to_string(fields).unwrap_or_default()
}

/// Decode a packed row; malformed input decodes to None
pub fn unpack(raw: &str) -> Option<Vec<String>> {
    serde_json::from_str(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_rows_survive() {
        let inner = pack(&["a".to_string(), "b|c".to_string()]);
        let outer = pack(&["1".to_string(), inner.clone()]);

        let fields = unpack(&outer).unwrap();
        assert_eq!(fields[0], "1");
        assert_eq!(unpack(&fields[1]).unwrap(), vec!["a", "b|c"]);
    }

    #[test]
    fn test_malformed_input_is_rejected() {
        assert!(unpack("").is_none());
        assert!(unpack("{\"not\":\"a list\"}").is_none());
        assert!(unpack("[1,2]").is_none());
    }
}
