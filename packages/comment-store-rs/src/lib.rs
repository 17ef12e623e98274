mod store;

pub use store::{AnchorRecord, CommentRecord, CommentStore, StoreError, ThreadRecord};

use napi::bindgen_prelude::Result as NapiResult;
use napi_derive::napi;
use std::sync::{Arc, Mutex};

fn to_napi_error(error: impl std::fmt::Display) -> napi::Error {
    napi::Error::from_reason(error.to_string())
}

#[napi(js_name = "CommentStore")]
pub struct CommentStoreBinding {
    store: Arc<Mutex<Option<CommentStore>>>,
}

#[napi]
impl CommentStoreBinding {
    #[napi(constructor)]
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(None)),
        }
    }

    #[napi]
    pub fn open(&self, db_path: String) -> NapiResult<()> {
        let store = CommentStore::open(&db_path).map_err(to_napi_error)?;
        let mut guard = self.lock_store()?;
        *guard = Some(store);
        Ok(())
    }

    #[napi(js_name = "saveThread")]
    pub fn save_thread(&self, thread: ThreadRecord) -> NapiResult<()> {
        self.with_store(|store| store.save_thread(&thread))
    }

    #[napi(js_name = "deleteThread")]
    pub fn delete_thread(&self, file_path: String, thread_id: String) -> NapiResult<()> {
        self.with_store(|store| store.delete_thread(&file_path, &thread_id))
    }

    #[napi(js_name = "findByFilePath")]
    pub fn find_by_file_path(&self, file_path: String) -> NapiResult<Vec<ThreadRecord>> {
        self.with_store(|store| store.find_by_file_path(&file_path))
    }

    #[napi(js_name = "getTags")]
    pub fn get_tags(&self, file_path: String) -> NapiResult<Vec<String>> {
        self.with_store(|store| store.get_tags(&file_path))
    }

    #[napi(js_name = "saveTags")]
    pub fn save_tags(&self, file_path: String, tags: Vec<String>) -> NapiResult<()> {
        self.with_store(|store| store.save_tags(&file_path, &tags))
    }

    #[napi]
    pub fn reset(&self) -> NapiResult<()> {
        self.with_store(|store| store.reset())
    }
}

impl CommentStoreBinding {
    fn lock_store(
        &self,
    ) -> NapiResult<std::sync::MutexGuard<'_, Option<CommentStore>>> {
        self.store
            .lock()
            .map_err(|_| to_napi_error("CommentStore state lock poisoned"))
    }

    fn with_store<T>(
        &self,
        operation: impl FnOnce(&CommentStore) -> Result<T, StoreError>,
    ) -> NapiResult<T> {
        let guard = self.lock_store()?;
        let store = guard
            .as_ref()
            .ok_or_else(|| to_napi_error("CommentStore is not opened"))?;
        operation(store).map_err(to_napi_error)
    }
}
