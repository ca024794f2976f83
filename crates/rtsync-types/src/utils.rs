//! Utility functions

use rand::RngExt;

pub const ID_LENGTH: usize = 24;
pub const SAFE: [char; 62] = [
	'0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
	'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B',
	'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U',
	'V', 'W', 'X', 'Y', 'Z',
];

/// Random document id, also used for op source tags
pub fn random_id() -> String {
	let mut rng = rand::rng();
	let mut result = String::with_capacity(ID_LENGTH);

	for _ in 0..ID_LENGTH {
		result.push(SAFE[rng.random_range(0..SAFE.len())]);
	}
	result
}

/// Document ids must be non-empty and must not contain the key separators
/// used by the stores
pub fn is_valid_doc_id(id: &str) -> bool {
	!id.is_empty() && !id.contains(['/', ':']) && !id.chars().any(char::is_control)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_random_id() {
		let a = random_id();
		let b = random_id();
		assert_eq!(a.len(), ID_LENGTH);
		assert_ne!(a, b);
		assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
		assert!(is_valid_doc_id(&a));
	}

	#[test]
	fn test_is_valid_doc_id() {
		assert!(!is_valid_doc_id(""));
		assert!(!is_valid_doc_id("a/b"));
		assert!(!is_valid_doc_id("widgets:a"));
		assert!(is_valid_doc_id("q-1.2"));
	}
}

// vim: ts=4
