use super::*;

#[get("/jobs/{id}")]
pub async fn get_job_by_id_handler(
    service: web::Data<ExecutionService>,
    path: web::Path<(u64,)>,
) -> impl Responder {
    let job_id = JobId(path.into_inner().0);

    match service.status(job_id) {
        Some(status) => HttpResponse::Ok().json(status),
        None => {
            log::info!("Got nothing with job id {job_id}");
            not_found(job_id)
        }
    }
}
