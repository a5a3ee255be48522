use super::*;

#[delete("/jobs/{id}")]
pub async fn delete_job_handler(
    service: web::Data<ExecutionService>,
    path: web::Path<(u64,)>,
) -> impl Responder {
    let job_id = JobId(path.into_inner().0);

    match service.cancel(job_id).await {
        Ok(outcome) => {
            let mut response = match outcome {
                CancelOutcome::Cancelled => HttpResponse::Ok(),
                CancelOutcome::CancellationRequested => HttpResponse::Accepted(),
            };
            match service.status(job_id) {
                Some(status) => response.json(status),
                None => response.finish(),
            }
        }
        Err(CancelError::AlreadyFinished(_)) => {
            HttpResponse::BadRequest().json(ErrorResponseWithMessage {
                reason: "ERR_INVALID_STATE",
                code: 2,
                message: format!("Job {job_id} already finished."),
            })
        }
        Err(CancelError::NotFound(_)) => not_found(job_id),
    }
}
