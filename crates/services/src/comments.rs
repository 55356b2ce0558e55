//! # Comments
//!
//! Comment creation and soft deletion, and reconstruction of the bounded
//! reply tree shown under a post.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use domains::{
    AppError, Comment, CommentStatus, DocumentStore, Direction, Permission, Post, PostStatus, Query,
    Record, Result, TargetType, Transaction, MAX_COMMENT_DEPTH,
};
use serde_json::json;

use crate::roles::RoleResolver;
use crate::{audit, new_id, require, RetryBudget};

pub const MAX_COMMENT_LENGTH: usize = 10_000;

/// A rendered comment. Top-level nodes have depth 1.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentNode {
    pub comment: Comment,
    pub depth: usize,
    pub replies: Vec<CommentNode>,
}

impl CommentNode {
    fn leaf(comment: Comment) -> Self {
        Self { comment, depth: 1, replies: Vec::new() }
    }
}

/// Builds the reply tree for a flat, creation-ordered list of comments.
///
/// Only active comments take part. A reply nests under its parent while the
/// parent sits above [`MAX_COMMENT_DEPTH`]. Deeper replies, replies whose
/// parent is absent, and members of parent cycles are lifted to the top level
/// instead. Sibling and top-level order follow the input order.
pub fn build_comment_tree(flat: Vec<Comment>) -> Vec<CommentNode> {
    let comments: Vec<Comment> = flat
        .into_iter()
        .filter(|c| c.status == CommentStatus::Active)
        .collect();
    let n = comments.len();

    let mut index: HashMap<&str, usize> = HashMap::with_capacity(n);
    for (i, c) in comments.iter().enumerate() {
        index.entry(c.id.as_str()).or_insert(i);
    }

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut roots = Vec::new();
    for (i, c) in comments.iter().enumerate() {
        match c.parent_comment_id.as_deref().and_then(|p| index.get(p).copied()) {
            Some(parent) if parent != i => children[parent].push(i),
            _ => roots.push(i),
        }
    }

    // Breadth-first pass over (node, depth, attach-to) triples.
    let mut depth = vec![0usize; n];
    let mut attach_to: Vec<Option<usize>> = vec![None; n];
    let mut visited = vec![false; n];
    let mut order = Vec::with_capacity(n);
    let mut queue: VecDeque<(usize, usize, Option<usize>)> =
        roots.into_iter().map(|i| (i, 1, None)).collect();

    loop {
        while let Some((i, d, parent)) = queue.pop_front() {
            if visited[i] {
                continue;
            }
            visited[i] = true;
            depth[i] = d;
            attach_to[i] = parent;
            order.push(i);

            for &child in &children[i] {
                if visited[child] {
                    continue;
                }
                if d < MAX_COMMENT_DEPTH {
                    queue.push_back((child, d + 1, Some(i)));
                } else {
                    queue.push_back((child, 1, None));
                }
            }
        }
        // Anything unreached hangs off a parent cycle. Break it at the first
        // such node and continue from there.
        match visited.iter().position(|v| !v) {
            Some(i) => queue.push_back((i, 1, None)),
            None => break,
        }
    }

    let mut slots: Vec<Option<CommentNode>> = comments.into_iter().map(|c| Some(CommentNode::leaf(c))).collect();
    let mut top_level: Vec<Option<CommentNode>> = vec![None; n];

    // Children come after their parent in BFS order, so walking it backwards
    // completes every node before it is moved into its parent.
    for &i in order.iter().rev() {
        let Some(mut node) = slots[i].take() else { continue };
        node.depth = depth[i];
        node.replies.reverse();
        match attach_to[i].and_then(|p| slots[p].as_mut()) {
            Some(parent) => parent.replies.push(node),
            None => top_level[i] = Some(node),
        }
    }

    top_level.into_iter().flatten().collect()
}

/// Input for [`CommentService::add_comment`].
#[derive(Debug, Clone)]
pub struct NewComment {
    pub post_id: String,
    pub author_id: String,
    pub parent_comment_id: Option<String>,
    pub content: String,
}

#[derive(Clone)]
pub struct CommentService {
    store: Arc<dyn DocumentStore>,
    roles: RoleResolver,
    max_attempts: u32,
}

impl CommentService {
    pub fn new(store: Arc<dyn DocumentStore>, roles: RoleResolver, max_attempts: u32) -> Self {
        Self { store, roles, max_attempts }
    }

    /// Stores a comment and bumps the post's `commentCount` atomically.
    #[tracing::instrument(skip(self, new), fields(post = %new.post_id, author = %new.author_id))]
    pub async fn add_comment(&self, new: NewComment) -> Result<Comment> {
        require("postId", &new.post_id)?;
        require("authorId", &new.author_id)?;
        require("content", &new.content)?;
        if new.content.chars().count() > MAX_COMMENT_LENGTH {
            return Err(AppError::validation(format!(
                "content exceeds {MAX_COMMENT_LENGTH} characters"
            )));
        }

        let mut budget = RetryBudget::new(self.max_attempts);
        while budget.next_attempt() {
            let mut tx = Transaction::new(self.store.as_ref());
            let post: Post = tx
                .get_record(&new.post_id)
                .await?
                .ok_or_else(|| AppError::not_found("post", &new.post_id))?;
            if post.status == PostStatus::Archived {
                return Err(AppError::validation(format!("post {} is archived", post.id)));
            }

            if let Some(parent_id) = &new.parent_comment_id {
                let parent: Comment = tx
                    .get_record(parent_id)
                    .await?
                    .ok_or_else(|| AppError::not_found("comment", parent_id))?;
                if parent.post_id != post.id {
                    return Err(AppError::validation(format!(
                        "comment {parent_id} belongs to another post"
                    )));
                }
                if parent.status != CommentStatus::Active {
                    return Err(AppError::validation(format!("comment {parent_id} was deleted")));
                }
            }

            let now = Utc::now();
            let comment = Comment {
                id: new_id(),
                post_id: post.id.clone(),
                community_id: post.community_id.clone(),
                author_id: new.author_id.clone(),
                parent_comment_id: new.parent_comment_id.clone(),
                content: new.content.clone(),
                stats: Default::default(),
                status: CommentStatus::Active,
                created_at: now,
            };
            let mut stats = post.stats;
            stats.comment_count += 1;
            tx.set(&comment)?;
            tx.merge(Post::COLLECTION, &post.id, json!({ "stats": stats, "updatedAt": now }))?;

            match tx.commit().await {
                Ok(()) => {
                    tracing::info!(comment = %comment.id, "comment added");
                    return Ok(comment);
                }
                Err(err) if err.is_conflict() => {
                    tracing::debug!(attempt = budget.attempt(), %err, "comment transaction conflicted, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(budget.exhausted(&format!("comment on post {}", new.post_id)))
    }

    /// Loads a post's comments oldest-first and arranges them into the reply tree.
    pub async fn load_thread(&self, post_id: &str) -> Result<Vec<CommentNode>> {
        if self.store.get(Post::COLLECTION, post_id).await?.is_none() {
            return Err(AppError::not_found("post", post_id));
        }
        let query = Query::collection(Comment::COLLECTION)
            .where_eq("postId", post_id)
            .order_by("createdAt", Direction::Ascending);
        let comments = self
            .store
            .query(&query)
            .await?
            .iter()
            .map(|doc| doc.decode::<Comment>())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(build_comment_tree(comments))
    }

    /// Soft-deletes a comment. Allowed for its author or a moderator.
    #[tracing::instrument(skip(self))]
    pub async fn delete_comment(&self, comment_id: &str, actor_id: &str) -> Result<()> {
        let mut budget = RetryBudget::new(self.max_attempts);
        while budget.next_attempt() {
            let mut tx = Transaction::new(self.store.as_ref());
            let comment: Comment = tx
                .get_record(comment_id)
                .await?
                .ok_or_else(|| AppError::not_found("comment", comment_id))?;
            if comment.status == CommentStatus::Deleted {
                return Err(AppError::validation(format!("comment {comment_id} is already deleted")));
            }
            self.roles
                .authorize(actor_id, &comment.community_id, Some(&comment.author_id), Permission::Moderate)
                .await?;

            tx.merge(Comment::COLLECTION, comment_id, json!({ "status": CommentStatus::Deleted }))?;
            // The post may already be purged; the comment still gets deleted.
            if let Some(post) = tx.get_record::<Post>(&comment.post_id).await? {
                let mut stats = post.stats;
                stats.comment_count = stats.comment_count.saturating_sub(1);
                tx.merge(Post::COLLECTION, &post.id, json!({ "stats": stats }))?;
            }
            tx.set(&audit::transition(
                actor_id,
                &comment.community_id,
                TargetType::Comment,
                comment_id,
                "comment.delete",
                CommentStatus::Active.as_str(),
                Some(CommentStatus::Deleted.as_str()),
            ))?;

            match tx.commit().await {
                Ok(()) => {
                    tracing::info!("comment deleted");
                    return Ok(());
                }
                Err(err) if err.is_conflict() => {
                    tracing::debug!(attempt = budget.attempt(), %err, "comment delete conflicted, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(budget.exhausted(&format!("delete of comment {comment_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration};

    fn comment(id: &str, parent: Option<&str>, offset: i64) -> Comment {
        let base: DateTime<Utc> = "2024-03-01T12:00:00Z".parse().unwrap();
        Comment {
            id: id.into(),
            post_id: "p1".into(),
            community_id: "c1".into(),
            author_id: "u1".into(),
            parent_comment_id: parent.map(Into::into),
            content: format!("comment {id}"),
            stats: Default::default(),
            status: CommentStatus::Active,
            created_at: base + Duration::seconds(offset),
        }
    }

    fn ids(nodes: &[CommentNode]) -> Vec<&str> {
        nodes.iter().map(|n| n.comment.id.as_str()).collect()
    }

    #[test]
    fn test_depth_cap_lifts_fourth_level_to_top() {
        let tree = build_comment_tree(vec![
            comment("A", None, 0),
            comment("B", Some("A"), 1),
            comment("C", Some("B"), 2),
            comment("D", Some("C"), 3),
        ]);

        assert_eq!(ids(&tree), vec!["A", "D"]);
        let a = &tree[0];
        assert_eq!(ids(&a.replies), vec!["B"]);
        assert_eq!(ids(&a.replies[0].replies), vec!["C"]);
        let c = &a.replies[0].replies[0];
        assert_eq!(c.depth, 3);
        assert!(c.replies.is_empty());
        assert_eq!(tree[1].depth, 1);
    }

    #[test]
    fn test_siblings_keep_creation_order() {
        let tree = build_comment_tree(vec![
            comment("A", None, 0),
            comment("B", Some("A"), 1),
            comment("X", None, 2),
            comment("C", Some("A"), 3),
        ]);
        assert_eq!(ids(&tree), vec!["A", "X"]);
        assert_eq!(ids(&tree[0].replies), vec!["B", "C"]);
    }

    #[test]
    fn test_deleted_parent_lifts_reply() {
        let mut deleted = comment("B", Some("A"), 1);
        deleted.status = CommentStatus::Deleted;
        let tree = build_comment_tree(vec![
            comment("A", None, 0),
            deleted,
            comment("C", Some("B"), 2),
        ]);
        assert_eq!(ids(&tree), vec!["A", "C"]);
        assert!(tree[0].replies.is_empty());
    }

    #[test]
    fn test_parent_cycle_does_not_lose_comments() {
        let tree = build_comment_tree(vec![
            comment("A", Some("B"), 0),
            comment("B", Some("A"), 1),
            comment("S", Some("S"), 2),
        ]);
        assert_eq!(ids(&tree), vec!["A", "S"]);
        assert_eq!(ids(&tree[0].replies), vec!["B"]);
    }

    #[test]
    fn test_long_chain_does_not_recurse() {
        let mut flat = vec![comment("0", None, 0)];
        for i in 1..20_000 {
            let parent = (i - 1).to_string();
            flat.push(comment(&i.to_string(), Some(&parent), i));
        }
        let tree = build_comment_tree(flat);
        // Every third comment in the chain starts a new top-level group.
        assert_eq!(tree.len(), 20_000 / 3 + 1);
        assert!(tree.iter().all(|n| n.depth == 1));
    }
}
