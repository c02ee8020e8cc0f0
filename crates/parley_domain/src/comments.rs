#![forbid(unsafe_code)]

//! Assembly of flat comment rows into nested reply threads.
//!
//! Comments on a publication are stored flat, each row carrying an optional
//! parent id. `build_thread` turns one publication's rows into a reply tree
//! without assuming the rows are well formed: a row whose parent is missing,
//! or whose parent chain never reaches a root, is reported instead of being
//! silently dropped or looped over forever.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::ParticipantId;

/// Store-assigned comment identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentId(pub i64);

/// Flat comment row as loaded from storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRow {
	pub id: CommentId,
	pub parent: Option<CommentId>,
	pub author: ParticipantId,
	pub text: String,
	pub posted_at_unix_ms: i64,
}

/// A comment together with its nested replies, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentNode {
	pub comment: CommentRow,
	pub replies: Vec<CommentNode>,
}

/// Assembled reply tree for one publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentThread {
	pub roots: Vec<CommentNode>,
	/// Rows that could not be attached: parent id unknown, or part of a
	/// parent cycle that no root reaches.
	pub orphans: Vec<CommentRow>,
}

/// Build the reply tree for one publication's rows.
///
/// Each row is attached at most once, so parent cycles cannot loop the
/// assembly; their members end up in `orphans`. Siblings are ordered by
/// post time, with the row id as tie-break.
pub fn build_thread(rows: Vec<CommentRow>) -> CommentThread {
	let known: HashSet<i64> = rows.iter().map(|r| r.id.0).collect();

	let mut root_rows: Vec<CommentRow> = Vec::new();
	let mut by_parent: HashMap<i64, Vec<CommentRow>> = HashMap::new();
	let mut orphans: Vec<CommentRow> = Vec::new();

	for row in rows {
		match row.parent {
			None => root_rows.push(row),
			Some(p) if p == row.id || !known.contains(&p.0) => orphans.push(row),
			Some(p) => by_parent.entry(p.0).or_default().push(row),
		}
	}

	let roots = attach(root_rows, &mut by_parent);

	// Anything still keyed here was never reached from a root, which means
	// its parent chain loops.
	orphans.extend(by_parent.into_values().flatten());
	orphans.sort_by_key(|r| (r.posted_at_unix_ms, r.id));

	CommentThread { roots, orphans }
}

fn attach(rows: Vec<CommentRow>, by_parent: &mut HashMap<i64, Vec<CommentRow>>) -> Vec<CommentNode> {
	let mut nodes: Vec<CommentNode> = rows
		.into_iter()
		.map(|row| {
			let children = by_parent.remove(&row.id.0).unwrap_or_default();
			let replies = attach(children, by_parent);
			CommentNode { comment: row, replies }
		})
		.collect();
	nodes.sort_by_key(|n| (n.comment.posted_at_unix_ms, n.comment.id));
	nodes
}
