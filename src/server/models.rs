use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct CreateJobRequest {
    pub(crate) file_name: String,
    pub(crate) data_base64: String,
    pub(crate) source_lang: Option<String>,
    pub(crate) target_lang: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CancelResponse {
    pub(crate) cancelled: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    pub(crate) error: String,
}
