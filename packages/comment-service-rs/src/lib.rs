mod service;

pub use service::{
    CommentService, MAX_COMMENTS_PER_THREAD, RenderedDocument, ResolvedThread, ServiceError,
};

use annotation_render_rs::RenderOptions;
use comment_store_rs::{CommentRecord, ThreadRecord};
use napi::bindgen_prelude::Result as NapiResult;
use napi_derive::napi;
use std::sync::{Arc, Mutex};

fn to_napi_error(error: impl std::fmt::Display) -> napi::Error {
    napi::Error::from_reason(error.to_string())
}

#[napi(object)]
#[derive(Clone)]
pub struct CreateThreadInput {
    #[napi(js_name = "filePath")]
    pub file_path: String,
    pub content: String,
    pub offset: u32,
    pub length: u32,
    pub body: String,
    pub author: String,
}

#[napi(object)]
pub struct ResolvedThreadOutput {
    pub thread: ThreadRecord,
    pub offset: u32,
    pub orphaned: bool,
}

#[napi(object)]
pub struct RenderedDocumentOutput {
    pub html: String,
    pub threads: Vec<ResolvedThreadOutput>,
}

#[napi(js_name = "CommentService")]
pub struct CommentServiceBinding {
    service: Arc<Mutex<Option<CommentService>>>,
}

#[napi]
impl CommentServiceBinding {
    #[napi(constructor)]
    pub fn new() -> Self {
        Self {
            service: Arc::new(Mutex::new(None)),
        }
    }

    #[napi]
    pub fn open(&self, db_path: String) -> NapiResult<()> {
        let service = CommentService::open(&db_path).map_err(to_napi_error)?;
        let mut guard = self.lock_service()?;
        *guard = Some(service);
        Ok(())
    }

    #[napi(js_name = "createThread")]
    pub fn create_thread(&self, input: CreateThreadInput) -> NapiResult<ThreadRecord> {
        self.with_service(|service| {
            service.create_thread(
                &input.file_path,
                &input.content,
                input.offset as usize,
                input.length as usize,
                &input.body,
                &input.author,
            )
        })
    }

    #[napi(js_name = "addReply")]
    pub fn add_reply(
        &self,
        file_path: String,
        thread_id: String,
        body: String,
        author: String,
    ) -> NapiResult<CommentRecord> {
        self.with_service(|service| service.add_reply(&file_path, &thread_id, &body, &author))
    }

    #[napi(js_name = "deleteComment")]
    pub fn delete_comment(
        &self,
        file_path: String,
        thread_id: String,
        comment_id: String,
    ) -> NapiResult<()> {
        self.with_service(|service| service.delete_comment(&file_path, &thread_id, &comment_id))
    }

    #[napi(js_name = "updateStatus")]
    pub fn update_status(
        &self,
        file_path: String,
        thread_id: String,
        status: Option<String>,
    ) -> NapiResult<()> {
        self.with_service(|service| {
            service.update_status(&file_path, &thread_id, status.as_deref())
        })
    }

    #[napi(js_name = "updateComment")]
    pub fn update_comment(
        &self,
        file_path: String,
        thread_id: String,
        comment_id: String,
        body: String,
    ) -> NapiResult<()> {
        self.with_service(|service| {
            service.update_comment(&file_path, &thread_id, &comment_id, &body)
        })
    }

    #[napi(js_name = "updateTags")]
    pub fn update_tags(
        &self,
        file_path: String,
        thread_id: String,
        comment_id: String,
        tags: Vec<String>,
    ) -> NapiResult<()> {
        self.with_service(|service| {
            service.update_tags(&file_path, &thread_id, &comment_id, &tags)
        })
    }

    #[napi(js_name = "getThreadsForFile")]
    pub fn get_threads_for_file(
        &self,
        file_path: String,
        content: String,
    ) -> NapiResult<Vec<ResolvedThreadOutput>> {
        let resolved =
            self.with_service(|service| service.get_threads_for_file(&file_path, &content))?;
        Ok(resolved.into_iter().map(to_resolved_output).collect())
    }

    #[napi(js_name = "getThreadAtOffset")]
    pub fn get_thread_at_offset(
        &self,
        file_path: String,
        content: String,
        offset: u32,
    ) -> NapiResult<Option<ResolvedThreadOutput>> {
        let hit = self.with_service(|service| {
            service.get_thread_at_offset(&file_path, &content, offset as usize)
        })?;
        Ok(hit.map(to_resolved_output))
    }

    #[napi(js_name = "renderDocument")]
    pub fn render_document(
        &self,
        file_path: String,
        content: String,
        options: Option<RenderOptions>,
    ) -> NapiResult<RenderedDocumentOutput> {
        let options = options.unwrap_or_default();
        let rendered = self.with_service(|service| {
            service.render_document(&file_path, &content, options.resource_base.as_deref())
        })?;
        Ok(RenderedDocumentOutput {
            html: rendered.html,
            threads: rendered.threads.into_iter().map(to_resolved_output).collect(),
        })
    }
}

impl CommentServiceBinding {
    fn lock_service(
        &self,
    ) -> NapiResult<std::sync::MutexGuard<'_, Option<CommentService>>> {
        self.service
            .lock()
            .map_err(|_| to_napi_error("CommentService state lock poisoned"))
    }

    fn with_service<T>(
        &self,
        operation: impl FnOnce(&CommentService) -> Result<T, ServiceError>,
    ) -> NapiResult<T> {
        let guard = self.lock_service()?;
        let service = guard
            .as_ref()
            .ok_or_else(|| to_napi_error("CommentService is not opened"))?;
        operation(service).map_err(to_napi_error)
    }
}

fn to_resolved_output(resolved: ResolvedThread) -> ResolvedThreadOutput {
    ResolvedThreadOutput {
        thread: resolved.thread,
        offset: resolved.offset as u32,
        orphaned: resolved.orphaned,
    }
}
