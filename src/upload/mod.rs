//! Resumable chunked-upload engine and its supporting pieces.

pub mod engine;
pub mod janitor;
pub mod keyed_lock;

pub use engine::{
    derive_upload_id, ownership_from_fields, ChunkHeaders, UploadChunkResponse, UploadEngine,
    UploadMeta, UploadStartRequest, UploadStartResponse,
};
