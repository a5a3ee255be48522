mod delete;
mod get;
mod post;

pub use delete::delete_job_handler;
pub use get::get_job_by_id_handler;
pub use post::post_job_handler;

use actix_web::{HttpRequest, HttpResponse, Responder, delete, get, post, web};
use serde::{Deserialize, Serialize};

use super::{ErrorResponse, ErrorResponseWithMessage};
use crate::error::{CancelError, SubmitError};
use crate::queue::JobId;
use crate::service::{CancelOutcome, ExecutionService, SubmissionRequest};
use crate::store::{NewSubmission, SubmissionStore};

/// Header carrying the caller identity verified upstream
pub const USER_ID_HEADER: &str = "X-User-Id";

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmission {
    pub problem_id: u32,
    pub code: String,
    pub language: String,
    pub priority: Option<i32>,
}

fn not_found(job_id: JobId) -> HttpResponse {
    HttpResponse::NotFound().json(ErrorResponseWithMessage {
        reason: "ERR_NOT_FOUND",
        code: 3,
        message: format!("Job {job_id} not found."),
    })
}
