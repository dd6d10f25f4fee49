mod configs;

use std::io::{Error, ErrorKind};
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{get, post, web, App, HttpResponse, HttpServer};
use c3_store::db::SqliteStore;
use c3_store::errors::C3Error;
use c3_store::protocol::{HashedEngine, ProtocolEngine};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const PAYLOAD_LIMIT: usize = 5_242_880;

#[derive(Clone)]
struct ServerState {
  store: Arc<SqliteStore>,
  engine: Arc<HashedEngine>,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .init();

  let confs = match configs::get_env_configs() {
    Ok(confs) => confs,
    Err(err) => {
      error!(%err, "unable to load configuration");
      return Err(Error::new(ErrorKind::InvalidInput, err));
    }
  };
  info!(port = %confs.port, store = ?confs.store, protocol = ?confs.protocol, "init instance");

  // an unreachable store is fatal
  let store = SqliteStore::open(&confs.store).map_err(|e| {
    error!(err = %e, "unable to open bucket store");
    Error::new(ErrorKind::Other, e.to_string())
  })?;
  let engine = HashedEngine::from_server_config(&confs.protocol)
    .map_err(|e| Error::new(ErrorKind::InvalidInput, e.to_string()))?;

  let server_state = ServerState {
    store: Arc::new(store),
    engine: Arc::new(engine),
  };

  info!("about to listen on 0.0.0.0:{}", confs.port);
  HttpServer::new(move || {
    let cors = Cors::permissive();

    App::new()
      .app_data(web::Data::new(server_state.clone()))
      .app_data(web::PayloadConfig::new(PAYLOAD_LIMIT))
      .wrap(cors)
      .service(index)
      .service(evaluate)
      .service(config)
  })
  .bind("0.0.0.0:".to_string() + &confs.port)?
  .run()
  .await
}

#[get("/")]
async fn index() -> &'static str {
  "Welcome to the compromised credential checker\n"
}

#[get("/config")]
async fn config(data: web::Data<ServerState>) -> HttpResponse {
  HttpResponse::Ok().json(data.engine.config())
}

#[post("/evaluate")]
async fn evaluate(body: web::Bytes, data: web::Data<ServerState>) -> HttpResponse {
  let state = data.clone();
  let res = web::block(move || {
    state.engine.handle_request(&body, state.store.as_ref())
  })
  .await;
  match res {
    Ok(Ok(resp)) => HttpResponse::Ok()
      .content_type("application/octet-stream")
      .body(resp),
    Ok(Err(e @ (C3Error::SerdeJSON(_) | C3Error::Protocol(_)))) => {
      info!(err = %e, "rejected client request");
      HttpResponse::BadRequest().finish()
    }
    Ok(Err(e)) => {
      error!(err = %e, "handling client request failed");
      HttpResponse::InternalServerError().finish()
    }
    Err(e) => {
      error!(err = %e, "request handler was cancelled");
      HttpResponse::InternalServerError().finish()
    }
  }
}
