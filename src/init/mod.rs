pub mod config;
pub mod logger;

/// Load the configuration and wire up logging.
///
/// Safe to call more than once; later calls are no-ops.
pub async fn new() {
    config::init().await;
    logger::init();
}
