mod inject;
mod protect;

pub use inject::{
    AnnotationRange, InjectOutcome, PLACEHOLDER_RE, PointKind, ResolvedPoint, end_token, inject,
    start_token,
};
pub use protect::{ProtectionRange, header_prefix_end, protection_at};

use napi_derive::napi;

#[napi(object)]
#[derive(Clone)]
pub struct ThreadRangeInput {
    pub offset: u32,
    pub length: u32,
    #[napi(js_name = "createdAt")]
    pub created_at: Option<String>,
}

#[napi(object)]
pub struct PointOutput {
    pub offset: u32,
    pub kind: String,
    #[napi(js_name = "threadIndex")]
    pub thread_index: u32,
}

#[napi(object)]
pub struct InjectOutput {
    pub content: String,
    pub points: Vec<PointOutput>,
}

#[napi(object)]
pub struct ProtectionRangeOutput {
    pub start: u32,
    pub end: u32,
}

#[napi(js_name = "injectPlaceholders")]
pub fn inject_placeholders(content: String, threads: Vec<ThreadRangeInput>) -> InjectOutput {
    let ranges: Vec<AnnotationRange> = threads
        .iter()
        .map(|thread| AnnotationRange {
            offset: thread.offset as usize,
            length: thread.length as usize,
            created_at: thread.created_at.clone(),
        })
        .collect();

    let outcome = inject(&content, &ranges);
    InjectOutput {
        content: outcome.content,
        points: outcome
            .points
            .into_iter()
            .map(|point| PointOutput {
                offset: point.offset as u32,
                kind: match point.kind {
                    PointKind::Start => "start".to_string(),
                    PointKind::End => "end".to_string(),
                },
                thread_index: point.thread_index as u32,
            })
            .collect(),
    }
}

#[napi(js_name = "protectionRangeAt")]
pub fn protection_range_at(content: String, offset: u32) -> Option<ProtectionRangeOutput> {
    protection_at(&content, offset as usize).map(|range| ProtectionRangeOutput {
        start: range.start as u32,
        end: range.end as u32,
    })
}
