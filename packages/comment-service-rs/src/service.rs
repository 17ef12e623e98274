//! Thread lifecycle orchestration: composes anchor relocation, placeholder
//! injection, rendering and the persistent store behind one service.
//!
//! Mutating operations keep the documented asymmetry: `add_reply` fails
//! loudly on an unknown thread, the update/delete operations silently return.
//! Anchor resolution failure is never fatal — the thread keeps its last-known
//! offset and is flagged orphaned.

use annotation_render_rs::{ThreadMarkup, render_annotated};
use chrono::{SecondsFormat, Utc};
use comment_store_rs::{AnchorRecord, CommentRecord, CommentStore, StoreError, ThreadRecord};
use markup_annotation_rs::AnnotationRange;
use std::path::Path;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Hard cap on conversation length, replies included.
pub const MAX_COMMENTS_PER_THREAD: usize = 50;

/// Marker tooltips show at most this many characters of the root comment.
const PREVIEW_MAX_CHARS: usize = 120;

/// Status a fresh thread's root comment starts with.
const DEFAULT_STATUS: &str = "open";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Thread not found: {0}")]
    ThreadNotFound(String),
    #[error("Reply limit reached for thread {0}")]
    ReplyLimitReached(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A thread positioned against the current document content.
#[derive(Clone, Debug)]
pub struct ResolvedThread {
    pub thread: ThreadRecord,
    /// Current offset, or the last-known one when `orphaned`.
    pub offset: usize,
    pub orphaned: bool,
}

#[derive(Clone, Debug)]
pub struct RenderedDocument {
    pub html: String,
    pub threads: Vec<ResolvedThread>,
}

pub struct CommentService {
    store: CommentStore,
}

impl CommentService {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        Ok(Self {
            store: CommentStore::open(db_path)?,
        })
    }

    /// Start a thread on a selection of the current content.
    pub fn create_thread(
        &self,
        file_path: &str,
        content: &str,
        offset: usize,
        length: usize,
        body: &str,
        author: &str,
    ) -> Result<ThreadRecord, ServiceError> {
        let anchor = anchor_relocation_rs::create_anchor(content, offset, length);
        let thread_id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let thread = ThreadRecord {
            id: thread_id.clone(),
            file_path: file_path.to_string(),
            anchor: to_record(&anchor),
            comments: vec![CommentRecord {
                id: format!("{thread_id}.0"),
                content: body.to_string(),
                author: author.to_string(),
                created_at: now.clone(),
                updated_at: now,
                status: Some(DEFAULT_STATUS.to_string()),
                tags: Vec::new(),
            }],
        };
        self.store.save_thread(&thread)?;
        Ok(thread)
    }

    /// Append a reply. Unknown threads and full threads are errors.
    pub fn add_reply(
        &self,
        file_path: &str,
        thread_id: &str,
        body: &str,
        author: &str,
    ) -> Result<CommentRecord, ServiceError> {
        let mut thread = self
            .find_thread(file_path, thread_id)?
            .ok_or_else(|| ServiceError::ThreadNotFound(thread_id.to_string()))?;
        if thread.comments.len() >= MAX_COMMENTS_PER_THREAD {
            return Err(ServiceError::ReplyLimitReached(thread_id.to_string()));
        }

        let now = now_rfc3339();
        let reply = CommentRecord {
            id: next_comment_id(&thread),
            content: body.to_string(),
            author: author.to_string(),
            created_at: now.clone(),
            updated_at: now,
            status: None,
            tags: Vec::new(),
        };
        thread.comments.push(reply.clone());
        self.store.save_thread(&thread)?;
        Ok(reply)
    }

    /// Remove a comment; deleting the last comment deletes the thread.
    /// Unknown ids are silently ignored.
    pub fn delete_comment(
        &self,
        file_path: &str,
        thread_id: &str,
        comment_id: &str,
    ) -> Result<(), ServiceError> {
        let Some(mut thread) = self.find_thread(file_path, thread_id)? else {
            return Ok(());
        };
        let Some(position) = thread
            .comments
            .iter()
            .position(|comment| comment.id == comment_id)
        else {
            return Ok(());
        };

        thread.comments.remove(position);
        if thread.comments.is_empty() {
            self.store.delete_thread(file_path, thread_id)?;
        } else {
            self.store.save_thread(&thread)?;
        }
        Ok(())
    }

    /// Set or clear the thread status, carried by the root comment.
    /// Unknown threads are silently ignored.
    pub fn update_status(
        &self,
        file_path: &str,
        thread_id: &str,
        status: Option<&str>,
    ) -> Result<(), ServiceError> {
        let Some(mut thread) = self.find_thread(file_path, thread_id)? else {
            return Ok(());
        };
        let Some(root) = thread.comments.first_mut() else {
            return Ok(());
        };
        root.status = status.map(str::to_string);
        root.updated_at = now_rfc3339();
        self.store.save_thread(&thread)?;
        Ok(())
    }

    /// Rewrite a comment's body. Unknown ids are silently ignored.
    pub fn update_comment(
        &self,
        file_path: &str,
        thread_id: &str,
        comment_id: &str,
        body: &str,
    ) -> Result<(), ServiceError> {
        let Some(mut thread) = self.find_thread(file_path, thread_id)? else {
            return Ok(());
        };
        let Some(comment) = thread
            .comments
            .iter_mut()
            .find(|comment| comment.id == comment_id)
        else {
            return Ok(());
        };
        comment.content = body.to_string();
        comment.updated_at = now_rfc3339();
        self.store.save_thread(&thread)?;
        Ok(())
    }

    /// Replace a comment's tags and fold new ones into the per-file tag
    /// dictionary. Unknown ids are silently ignored.
    pub fn update_tags(
        &self,
        file_path: &str,
        thread_id: &str,
        comment_id: &str,
        tags: &[String],
    ) -> Result<(), ServiceError> {
        let Some(mut thread) = self.find_thread(file_path, thread_id)? else {
            return Ok(());
        };
        let Some(comment) = thread
            .comments
            .iter_mut()
            .find(|comment| comment.id == comment_id)
        else {
            return Ok(());
        };
        comment.tags = tags.to_vec();
        comment.updated_at = now_rfc3339();
        self.store.save_thread(&thread)?;

        let mut dictionary = self.store.get_tags(file_path)?;
        for tag in tags {
            if !dictionary.contains(tag) {
                dictionary.push(tag.clone());
            }
        }
        self.store.save_tags(file_path, &dictionary)?;
        Ok(())
    }

    /// Load all threads for a file and re-resolve every anchor against the
    /// current content. Resolved offsets are not written back.
    pub fn get_threads_for_file(
        &self,
        file_path: &str,
        content: &str,
    ) -> Result<Vec<ResolvedThread>, ServiceError> {
        let threads = self.store.find_by_file_path(file_path)?;
        Ok(threads
            .into_iter()
            .map(|thread| {
                let anchor = to_anchor(&thread.anchor);
                match anchor_relocation_rs::resolve_offset(content, &anchor) {
                    Some(offset) => ResolvedThread {
                        thread,
                        offset,
                        orphaned: false,
                    },
                    None => {
                        debug!(thread_id = %thread.id, "anchor did not resolve, keeping last-known offset");
                        ResolvedThread {
                            offset: thread.anchor.offset as usize,
                            thread,
                            orphaned: true,
                        }
                    }
                }
            })
            .collect())
    }

    /// First thread whose resolved range contains `offset`, if any.
    pub fn get_thread_at_offset(
        &self,
        file_path: &str,
        content: &str,
        offset: usize,
    ) -> Result<Option<ResolvedThread>, ServiceError> {
        let resolved = self.get_threads_for_file(file_path, content)?;
        Ok(resolved.into_iter().find(|candidate| {
            let start = candidate.offset;
            let end = start + candidate.thread.anchor.length as usize;
            !candidate.orphaned && offset >= start && offset < end
        }))
    }

    /// Full pipeline: resolve every thread, inject placeholders for the
    /// non-orphaned ones, render to HTML and substitute the markers.
    pub fn render_document(
        &self,
        file_path: &str,
        content: &str,
        resource_base: Option<&str>,
    ) -> Result<RenderedDocument, ServiceError> {
        let resolved = self.get_threads_for_file(file_path, content)?;

        let anchored: Vec<&ResolvedThread> = resolved
            .iter()
            .filter(|candidate| !candidate.orphaned)
            .collect();
        let ranges: Vec<AnnotationRange> = anchored
            .iter()
            .map(|candidate| AnnotationRange {
                offset: candidate.offset,
                length: candidate.thread.anchor.length as usize,
                created_at: candidate
                    .thread
                    .comments
                    .first()
                    .map(|root| root.created_at.clone()),
            })
            .collect();
        let markups: Vec<ThreadMarkup> = anchored
            .iter()
            .map(|candidate| ThreadMarkup {
                thread_id: candidate.thread.id.clone(),
                preview: candidate
                    .thread
                    .comments
                    .first()
                    .map(|root| build_preview(&root.content))
                    .unwrap_or_default(),
            })
            .collect();

        let injected = markup_annotation_rs::inject(content, &ranges);
        let html = render_annotated(&injected.content, &markups, resource_base);
        Ok(RenderedDocument {
            html,
            threads: resolved,
        })
    }

    fn find_thread(
        &self,
        file_path: &str,
        thread_id: &str,
    ) -> Result<Option<ThreadRecord>, ServiceError> {
        Ok(self
            .store
            .find_by_file_path(file_path)?
            .into_iter()
            .find(|thread| thread.id == thread_id))
    }
}

/// Next dotted comment id for a thread: `"<threadId>.<n>"`, one past the
/// highest suffix currently in the conversation.
fn next_comment_id(thread: &ThreadRecord) -> String {
    let next = thread
        .comments
        .iter()
        .filter_map(|comment| {
            comment
                .id
                .rsplit_once('.')
                .and_then(|(_, suffix)| suffix.parse::<u64>().ok())
        })
        .max()
        .map_or(0, |highest| highest + 1);
    format!("{}.{next}", thread.id)
}

/// Whitespace-collapsed, truncated tooltip text for a marker.
fn build_preview(content: &str) -> String {
    let mut preview = String::with_capacity(content.len().min(PREVIEW_MAX_CHARS));
    let mut last_was_space = false;
    for ch in content.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                preview.push(' ');
                last_was_space = true;
            }
        } else {
            preview.push(ch);
            last_was_space = false;
        }
        if preview.chars().count() >= PREVIEW_MAX_CHARS {
            break;
        }
    }
    preview
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_record(anchor: &anchor_relocation_rs::Anchor) -> AnchorRecord {
    AnchorRecord {
        text: anchor.text.clone(),
        context_before: anchor.context_before.clone(),
        context_after: anchor.context_after.clone(),
        offset: anchor.offset,
        length: anchor.length,
    }
}

fn to_anchor(record: &AnchorRecord) -> anchor_relocation_rs::Anchor {
    anchor_relocation_rs::Anchor {
        text: record.text.clone(),
        context_before: record.context_before.clone(),
        context_after: record.context_after.clone(),
        offset: record.offset,
        length: record.length,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const FILE: &str = "notes/readme.md";
    const CONTENT: &str = "Alpha beta gamma delta epsilon zeta eta theta.";

    fn service(dir: &tempfile::TempDir) -> CommentService {
        CommentService::open(dir.path().join("comments.db")).expect("open service")
    }

    #[test]
    fn created_thread_resolves_at_its_offset() {
        let dir = tempdir().unwrap();
        let service = service(&dir);
        let thread = service
            .create_thread(FILE, CONTENT, 11, 5, "note on gamma", "ada")
            .unwrap();
        assert_eq!(thread.comments[0].id, format!("{}.0", thread.id));
        assert_eq!(thread.comments[0].status.as_deref(), Some("open"));

        let resolved = service.get_threads_for_file(FILE, CONTENT).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].offset, 11);
        assert!(!resolved[0].orphaned);
    }

    #[test]
    fn resolution_follows_edits() {
        let dir = tempdir().unwrap();
        let service = service(&dir);
        service
            .create_thread(FILE, CONTENT, 11, 5, "note", "ada")
            .unwrap();

        let edited = format!("Inserted intro.\n{CONTENT}");
        let resolved = service.get_threads_for_file(FILE, &edited).unwrap();
        assert_eq!(resolved[0].offset, 11 + 16);
        assert!(!resolved[0].orphaned);
    }

    #[test]
    fn unresolvable_anchor_is_orphaned_but_kept() {
        let dir = tempdir().unwrap();
        let service = service(&dir);
        service
            .create_thread(FILE, CONTENT, 11, 5, "note", "ada")
            .unwrap();

        let edited = CONTENT.replace("gamma ", "");
        let resolved = service.get_threads_for_file(FILE, &edited).unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].orphaned);
        assert_eq!(resolved[0].offset, 11);
        assert_eq!(resolved[0].thread.comments[0].content, "note");
    }

    #[test]
    fn replies_get_monotonic_dotted_ids() {
        let dir = tempdir().unwrap();
        let service = service(&dir);
        let thread = service
            .create_thread(FILE, CONTENT, 0, 5, "root", "ada")
            .unwrap();

        let first = service.add_reply(FILE, &thread.id, "first", "lin").unwrap();
        let second = service.add_reply(FILE, &thread.id, "second", "ada").unwrap();
        assert_eq!(first.id, format!("{}.1", thread.id));
        assert_eq!(second.id, format!("{}.2", thread.id));
        assert_eq!(first.status, None);

        // A deletion in the middle does not disturb the counter.
        service.delete_comment(FILE, &thread.id, &first.id).unwrap();
        let third = service.add_reply(FILE, &thread.id, "third", "lin").unwrap();
        assert_eq!(third.id, format!("{}.3", thread.id));
    }

    #[test]
    fn reply_to_unknown_thread_fails() {
        let dir = tempdir().unwrap();
        let service = service(&dir);
        let error = service
            .add_reply(FILE, "missing", "body", "ada")
            .expect_err("should fail");
        assert!(matches!(error, ServiceError::ThreadNotFound(_)));
    }

    #[test]
    fn reply_cap_is_enforced() {
        let dir = tempdir().unwrap();
        let service = service(&dir);
        let thread = service
            .create_thread(FILE, CONTENT, 0, 5, "root", "ada")
            .unwrap();
        for index in 0..MAX_COMMENTS_PER_THREAD - 1 {
            service
                .add_reply(FILE, &thread.id, &format!("reply {index}"), "lin")
                .unwrap();
        }
        let error = service
            .add_reply(FILE, &thread.id, "one too many", "lin")
            .expect_err("cap reached");
        assert!(matches!(error, ServiceError::ReplyLimitReached(_)));
    }

    #[test]
    fn deleting_the_last_comment_deletes_the_thread() {
        let dir = tempdir().unwrap();
        let service = service(&dir);
        let thread = service
            .create_thread(FILE, CONTENT, 0, 5, "root", "ada")
            .unwrap();
        let root_id = thread.comments[0].id.clone();

        // Unknown ids are silently ignored.
        service.delete_comment(FILE, "missing", "x").unwrap();
        service.delete_comment(FILE, &thread.id, "missing").unwrap();

        service.delete_comment(FILE, &thread.id, &root_id).unwrap();
        assert!(service.get_threads_for_file(FILE, CONTENT).unwrap().is_empty());
    }

    #[test]
    fn status_lives_on_the_root_comment() {
        let dir = tempdir().unwrap();
        let service = service(&dir);
        let thread = service
            .create_thread(FILE, CONTENT, 0, 5, "root", "ada")
            .unwrap();
        service.add_reply(FILE, &thread.id, "reply", "lin").unwrap();

        service
            .update_status(FILE, &thread.id, Some("resolved"))
            .unwrap();
        // Unknown thread: silent no-op.
        service.update_status(FILE, "missing", Some("x")).unwrap();

        let resolved = service.get_threads_for_file(FILE, CONTENT).unwrap();
        let comments = &resolved[0].thread.comments;
        assert_eq!(comments[0].status.as_deref(), Some("resolved"));
        assert_eq!(comments[1].status, None);
    }

    #[test]
    fn update_comment_rewrites_the_body() {
        let dir = tempdir().unwrap();
        let service = service(&dir);
        let thread = service
            .create_thread(FILE, CONTENT, 0, 5, "root", "ada")
            .unwrap();
        let root_id = thread.comments[0].id.clone();

        service
            .update_comment(FILE, &thread.id, &root_id, "edited body")
            .unwrap();
        service
            .update_comment(FILE, &thread.id, "missing", "ignored")
            .unwrap();

        let resolved = service.get_threads_for_file(FILE, CONTENT).unwrap();
        assert_eq!(resolved[0].thread.comments[0].content, "edited body");
    }

    #[test]
    fn updating_tags_syncs_the_file_dictionary() {
        let dir = tempdir().unwrap();
        let service = service(&dir);
        let thread = service
            .create_thread(FILE, CONTENT, 0, 5, "root", "ada")
            .unwrap();
        let root_id = thread.comments[0].id.clone();

        let tags = vec!["todo".to_string(), "docs".to_string()];
        service
            .update_tags(FILE, &thread.id, &root_id, &tags)
            .unwrap();
        let more = vec!["docs".to_string(), "urgent".to_string()];
        service
            .update_tags(FILE, &thread.id, &root_id, &more)
            .unwrap();

        let resolved = service.get_threads_for_file(FILE, CONTENT).unwrap();
        assert_eq!(resolved[0].thread.comments[0].tags, more);
    }

    #[test]
    fn thread_at_offset_returns_first_containing() {
        let dir = tempdir().unwrap();
        let service = service(&dir);
        service
            .create_thread(FILE, CONTENT, 0, 5, "on alpha", "ada")
            .unwrap();
        service
            .create_thread(FILE, CONTENT, 11, 5, "on gamma", "ada")
            .unwrap();

        let hit = service
            .get_thread_at_offset(FILE, CONTENT, 13)
            .unwrap()
            .expect("offset inside gamma thread");
        assert_eq!(hit.offset, 11);

        assert!(service.get_thread_at_offset(FILE, CONTENT, 9).unwrap().is_none());
    }

    #[test]
    fn render_document_nests_overlapping_threads() {
        let dir = tempdir().unwrap();
        let service = service(&dir);
        let content = "Hello world";
        service
            .create_thread(FILE, content, 0, 5, "outer note", "ada")
            .unwrap();
        service
            .create_thread(FILE, content, 3, 5, "inner note", "lin")
            .unwrap();

        let rendered = service.render_document(FILE, content, None).unwrap();
        assert_eq!(rendered.html.matches("<mark").count(), 4);
        assert_eq!(rendered.html.matches("</mark>").count(), 4);
        assert_eq!(rendered.html.matches("comment-highlight-first").count(), 2);
        assert!(!rendered.html.contains("@@comment-"));
        assert_eq!(rendered.threads.len(), 2);
    }

    #[test]
    fn orphaned_threads_are_reported_but_not_rendered() {
        let dir = tempdir().unwrap();
        let service = service(&dir);
        service
            .create_thread(FILE, CONTENT, 11, 5, "will orphan", "ada")
            .unwrap();

        let edited = CONTENT.replace("gamma ", "");
        let rendered = service.render_document(FILE, &edited, None).unwrap();
        assert!(!rendered.html.contains("<mark"));
        assert_eq!(rendered.threads.len(), 1);
        assert!(rendered.threads[0].orphaned);
    }

    #[test]
    fn preview_is_collapsed_and_truncated() {
        assert_eq!(build_preview("  a\n\n  b   c "), "a b c");
        let long = "word ".repeat(60);
        assert_eq!(build_preview(&long).chars().count(), PREVIEW_MAX_CHARS);
    }
}
