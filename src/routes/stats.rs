use actix_web::{HttpResponse, Responder, get, web};

use crate::service::ExecutionService;

#[get("/stats")]
pub async fn get_stats_handler(service: web::Data<ExecutionService>) -> impl Responder {
    HttpResponse::Ok().json(service.stats())
}
