use actix_web::{middleware, web, App, HttpServer};
use imgconv::config::Settings;
use imgconv::server;
use imgconv::util::init_tracing;

use tracing::info;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    init_tracing(&settings.log_level);

    let addr = (settings.host.clone(), settings.port);
    info!("listening on {}:{} with {settings:?}", addr.0, addr.1);

    let settings = web::Data::new(settings);

    // Start the HTTP server
    HttpServer::new(move || {
        App::new()
            .app_data(settings.clone())
            .wrap(middleware::Logger::default())
            .wrap(server::cors())
            .configure(server::configure)
    })
    .bind(addr)?
    .run()
    .await?;

    Ok(())
}
