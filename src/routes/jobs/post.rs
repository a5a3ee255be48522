use super::*;

#[post("/jobs")]
pub async fn post_job_handler(
    req: HttpRequest,
    service: web::Data<ExecutionService>,
    store: web::Data<dyn SubmissionStore>,
    body: web::Json<JobSubmission>,
) -> impl Responder {
    let Some(user_id) = caller_identity(&req) else {
        return HttpResponse::BadRequest().json(ErrorResponseWithMessage {
            reason: "ERR_INVALID_ARGUMENT",
            code: 1,
            message: format!("Missing {USER_ID_HEADER} header."),
        });
    };
    let body = body.into_inner();

    let submission = NewSubmission {
        user_id: user_id.clone(),
        problem_id: body.problem_id,
        code: body.code.clone(),
        language: body.language.clone(),
    };
    let submission_id = match store.create(&submission).await {
        Ok(id) => {
            log::info!("Created submission {id} for user {user_id}");
            id
        }
        Err(e) => {
            log::error!("Failed to create submission: {e:#}");
            return HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_EXTERNAL",
                code: 5,
            });
        }
    };

    let request = SubmissionRequest {
        submission_id,
        user_id,
        problem_id: body.problem_id,
        code: body.code,
        language: body.language,
        priority: body.priority,
    };

    match service.submit(request).await {
        Ok(receipt) => HttpResponse::Ok().json(receipt),
        Err(e) => {
            log::info!("Submission {submission_id} refused: {e}");
            if let Err(discard_err) = store.discard(submission_id).await {
                log::warn!("Failed to discard submission {submission_id}: {discard_err:#}");
            }
            submit_error_response(&e)
        }
    }
}

fn caller_identity(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn submit_error_response(err: &SubmitError) -> HttpResponse {
    let message = err.to_string();
    match err {
        SubmitError::AdmissionRejected { .. } => {
            HttpResponse::ServiceUnavailable().json(ErrorResponseWithMessage {
                reason: "ERR_RATE_LIMIT",
                code: 4,
                message,
            })
        }
        SubmitError::Draining => HttpResponse::ServiceUnavailable().json(ErrorResponseWithMessage {
            reason: "ERR_INVALID_STATE",
            code: 2,
            message,
        }),
        SubmitError::Validation(_) => HttpResponse::BadRequest().json(ErrorResponseWithMessage {
            reason: "ERR_INVALID_ARGUMENT",
            code: 1,
            message,
        }),
        SubmitError::DuplicateSubmission(_) => {
            HttpResponse::BadRequest().json(ErrorResponseWithMessage {
                reason: "ERR_INVALID_STATE",
                code: 2,
                message,
            })
        }
        SubmitError::Provider(e) => {
            log::error!("Problem provider failed: {e:#}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_EXTERNAL",
                code: 5,
            })
        }
    }
}
