use std::path::Path;

use log::{error, info, warn, LevelFilter};
use log4rs::{
    append::console::ConsoleAppender,
    config::{Appender, Config as LogConfig, Root},
    encode::pattern::PatternEncoder,
};
use rocket::Error as RocketError;
use thiserror::Error;
use votecommit_backend::config::Config;

/// Logging config used unless `VOTECOMMIT_LOG_CONFIG` names another file.
const LOG_CONFIG: &str = "log4rs.yaml";

/// Errors that are critical to the entire server.
#[derive(Debug, Error)]
enum Error {
    #[error(transparent)]
    RocketError(#[from] RocketError),
}

/// Initialise logging from the config file, or log everything at `info` to
/// the console if there isn't one.
fn init_logging() {
    let path = std::env::var("VOTECOMMIT_LOG_CONFIG").unwrap_or_else(|_| LOG_CONFIG.to_string());
    if Path::new(&path).exists() {
        log4rs::init_file(&path, log4rs_dynamic_filters::default_deserializers())
            .expect("Failed to initialise logging");
        info!("Initialised logging from {path}");
    } else {
        let console = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new("{d} {h({l:<5})} [{t}] {m}{n}")))
            .build();
        let config = LogConfig::builder()
            .appender(Appender::builder().build("stdout", Box::new(console)))
            .build(Root::builder().appender("stdout").build(LevelFilter::Info))
            .expect("Failed to build fallback logging config");
        log4rs::init_config(config).expect("Failed to initialise logging");
        warn!("No logging config at {path}, logging to the console");
    }
}

/// Summarise the pipeline settings the server is running with.
fn log_pipeline(config: &Config) {
    let policy = config.retry_policy();
    info!(
        "Relay: batches of {}, held for at most {}s; timestamps bucketed to {}s",
        config.mix_batch_size(),
        config.mix_max_hold().num_seconds(),
        config.timestamp_bucket_secs()
    );
    info!(
        "Anchoring: up to {} attempts, backoff {}ms to {}ms",
        policy.max_attempts,
        policy.base_delay.num_milliseconds(),
        policy.max_delay.num_milliseconds()
    );
    info!(
        "Verification: {} lookups per client per {}s{}",
        config.verify_rate_limit(),
        config.verify_rate_window().as_secs(),
        if config.verify_trust_ip_header() {
            ", clients identified by forwarding header"
        } else {
            ""
        }
    );
}

async fn run() -> Result<(), Error> {
    info!("Assembling commitment pipeline...");
    let rocket = votecommit_backend::build().ignite().await?;
    info!("...pipeline assembled!");
    if let Some(config) = rocket.state::<Config>() {
        log_pipeline(config);
    }
    let protocol = if rocket.config().tls_enabled() {
        "https"
    } else {
        "http"
    };
    let ip = &rocket.config().address;
    let port = &rocket.config().port;
    info!("Accepting tokens and commitments on {protocol}://{ip}:{port}");
    // Disable rocket logging from now on.
    log4rs_dynamic_filters::DynamicLevelFilter::set("rocket", LevelFilter::Off);
    let _ = rocket.launch().await?;
    info!("Server stopped; relay flushed and anchoring worker stopped");
    Ok(())
}

#[rocket::main]
async fn main() {
    init_logging();

    if let Err(err) = run().await {
        error!("{err}");
        error!("Critical failure, shutting down");
        std::process::exit(1)
    }
}
