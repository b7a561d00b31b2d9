//! Request/response types for contact endpoints.

use crate::session::ContactForm;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Absent fields deserialize as empty and are reported by validation.
#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
#[serde(default)]
pub struct SubmitRequest {
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub email: String,
    pub comments: String,
    /// Hidden form field; real users leave it empty.
    pub website: String,
}

impl SubmitRequest {
    #[must_use]
    pub fn form(&self) -> ContactForm {
        ContactForm {
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            phone: self.phone.clone(),
            email: self.email.clone(),
            comments: self.comments.clone(),
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SubmitResponse {
    pub email: String,
    pub message: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
#[serde(default)]
pub struct VerifyRequest {
    pub email: String,
    pub code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct VerifyResponse {
    pub submission_id: String,
    pub message: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
#[serde(default)]
pub struct ResendRequest {
    pub email: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_locally: Option<bool>,
}

impl ErrorResponse {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SubmissionStatus {
    pub id: String,
    pub status: String,
    pub submitted_at: String,
    pub email: String,
    pub name: String,
}
