use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::routes::{
    delete_job_handler, get_job_by_id_handler, get_stats_handler, json_error_handler,
    post_job_handler,
};
use crate::service::ExecutionService;
use crate::store::SubmissionStore;

pub fn build_server(
    server_config: ServerConfig,
    service: Arc<ExecutionService>,
    store: Arc<dyn SubmissionStore>,
) -> std::io::Result<Server> {
    let service = web::Data::from(service);
    let store: web::Data<dyn SubmissionStore> = web::Data::from(store);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(service.clone())
            .app_data(store.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .wrap(middleware::Logger::default())
            .service(post_job_handler)
            .service(get_job_by_id_handler)
            .service(delete_job_handler)
            .service(get_stats_handler)
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(12345),
    ))?
    .run();

    Ok(server)
}
