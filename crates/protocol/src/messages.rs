use serde::{Deserialize, Serialize};

/// Body of `POST /uploads/{sessionKey}/finalize`.
///
/// The server assembles the acked chunks and checks the whole-file digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub file_name: String,
    pub file_size: u64,
    pub digest: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
    pub chunk_count: u32,
}

/// Response to a finalize call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,
}
