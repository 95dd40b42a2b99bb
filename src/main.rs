use sqlx::postgres::PgPoolOptions;

mod models;
mod repositories;
pub mod services;
pub mod settings;

#[tokio::main]
async fn main() {
    init_logging("log4rs.yaml");

    let config = settings::Settings::new().expect("Could not load config file.");
    let conn = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.postgres.url)
        .await
        .expect("Could not connect to database.");

    log::info!("starting services");
    services::start_services(conn, config)
        .await
        .expect("Could not start services.");
}

fn init_logging(path: &str) {
    if log4rs::init_file(path, Default::default()).is_err() {
        // No config file around (tests, containers): plain console logging.
        use log4rs::append::console::ConsoleAppender;
        use log4rs::config::{Appender, Config, Root};

        let stdout = ConsoleAppender::builder().build();
        let config = Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .build(
                Root::builder()
                    .appender("stdout")
                    .build(log::LevelFilter::Info),
            )
            .expect("Could not build logging config.");
        log4rs::init_config(config).expect("Could not initialize logging.");
    }
}
