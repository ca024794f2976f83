//! Positional list changes and a diff producing them
//!
//! Live queries report membership as a sequence of splice operations. The
//! same operations are produced here when a new id list has to be reached
//! from an old one, so consumers only ever deal with one kind of change.

use std::collections::HashSet;

use crate::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListChange {
	/// `ids` inserted so the first of them ends up at `index`
	Insert { index: usize, ids: Vec<String> },
	/// `ids` removed starting at `index`
	Remove { index: usize, ids: Vec<String> },
	/// `count` items removed at `from`, then inserted at `to` of the shortened list
	Move { from: usize, to: usize, count: usize },
}

/// Apply one change with splice semantics
pub fn apply_change(list: &mut Vec<String>, change: &ListChange) -> RtResult<()> {
	match change {
		ListChange::Insert { index, ids } => {
			if *index > list.len() {
				return Err(out_of_range(change, list.len()));
			}
			list.splice(*index..*index, ids.iter().cloned());
		}
		ListChange::Remove { index, ids } => {
			let end = index.saturating_add(ids.len());
			if end > list.len() {
				return Err(out_of_range(change, list.len()));
			}
			if list[*index..end] != ids[..] {
				warn!("list remove at {} does not match local ids", index);
			}
			list.drain(*index..end);
		}
		ListChange::Move { from, to, count } => {
			let end = from.saturating_add(*count);
			if end > list.len() || to.saturating_add(*count) > list.len() {
				return Err(out_of_range(change, list.len()));
			}
			let moved: Vec<String> = list.drain(*from..end).collect();
			list.splice(*to..*to, moved);
		}
	}
	Ok(())
}

fn out_of_range(change: &ListChange, len: usize) -> Error {
	Error::InvalidOp(format!("list change {:?} out of range for length {}", change, len))
}

/// Changes turning `before` into `after`.
///
/// Ids are expected to be unique within each list. Removals come first, then
/// single-item moves putting the surviving ids in their new relative order,
/// then insertions in ascending index order.
pub fn diff_ids(before: &[String], after: &[String]) -> Vec<ListChange> {
	let after_set: HashSet<&str> = after.iter().map(String::as_str).collect();
	let mut changes = Vec::new();
	let mut working: Vec<String> = Vec::with_capacity(before.len());

	for id in before {
		if after_set.contains(id.as_str()) {
			working.push(id.clone());
			continue;
		}
		let index = working.len();
		match changes.last_mut() {
			Some(ListChange::Remove { index: last, ids }) if *last == index => ids.push(id.clone()),
			_ => changes.push(ListChange::Remove { index, ids: vec![id.clone()] }),
		}
	}

	let kept: HashSet<&str> = working.iter().map(String::as_str).collect();
	let target: Vec<&String> = after.iter().filter(|id| kept.contains(id.as_str())).collect();
	for (pos, id) in target.into_iter().enumerate() {
		if working[pos] == *id {
			continue;
		}
		if let Some(from) = working[pos..].iter().position(|w| w == id).map(|p| p + pos) {
			let moved = working.remove(from);
			working.insert(pos, moved);
			changes.push(ListChange::Move { from, to: pos, count: 1 });
		}
	}

	for (index, id) in after.iter().enumerate() {
		if working.get(index) == Some(id) {
			continue;
		}
		working.insert(index, id.clone());
		match changes.last_mut() {
			Some(ListChange::Insert { index: start, ids }) if *start + ids.len() == index => {
				ids.push(id.clone());
			}
			_ => changes.push(ListChange::Insert { index, ids: vec![id.clone()] }),
		}
	}

	changes
}

#[cfg(test)]
mod tests {
	use super::*;

	fn list(ids: &[&str]) -> Vec<String> {
		ids.iter().map(ToString::to_string).collect()
	}

	fn check(before: &[&str], after: &[&str]) -> Vec<ListChange> {
		let (before, after) = (list(before), list(after));
		let changes = diff_ids(&before, &after);
		let mut working = before.clone();
		for change in &changes {
			apply_change(&mut working, change).expect("change applies");
		}
		assert_eq!(working, after);
		changes
	}

	#[test]
	fn test_reorder_is_single_move() {
		let changes = check(&["b", "c", "a"], &["a", "b", "c"]);
		assert_eq!(changes, vec![ListChange::Move { from: 2, to: 0, count: 1 }]);
	}

	#[test]
	fn test_removes_and_inserts_coalesce() {
		let changes = check(&["a", "b", "c", "d"], &["a", "x", "y", "d"]);
		assert_eq!(
			changes,
			vec![
				ListChange::Remove { index: 1, ids: list(&["b", "c"]) },
				ListChange::Insert { index: 1, ids: list(&["x", "y"]) },
			]
		);
	}

	#[test]
	fn test_mixed_changes() {
		check(&[], &["a", "b"]);
		check(&["a", "b"], &[]);
		check(&["a", "b", "c", "d", "e"], &["e", "x", "c", "a"]);
		check(&["q", "w", "e", "r", "t", "y"], &["y", "t", "r", "e", "w", "q"]);
		assert!(check(&["a", "b"], &["a", "b"]).is_empty());
	}

	#[test]
	fn test_apply_out_of_range() {
		let mut ids = list(&["a"]);
		let change = ListChange::Insert { index: 3, ids: list(&["z"]) };
		assert!(apply_change(&mut ids, &change).is_err());
		let change = ListChange::Move { from: 0, to: 1, count: 1 };
		assert!(apply_change(&mut ids, &change).is_err());
		assert_eq!(ids, list(&["a"]));
	}
}

// vim: ts=4
