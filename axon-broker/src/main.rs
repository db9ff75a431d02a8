use std::path::PathBuf;

use axon_broker::Config;

fn main() {
    env_logger::init();

    let config = match std::env::args_os().nth(1) {
        Some(path) => match Config::load(&PathBuf::from(path)) {
            Ok(config) => config,
            Err(err) => panic!("Couldn't load the broker config: {err:?}"),
        },
        None => Config::default(),
    };

    log::info!("axon-broker listening on {}", config.socket_path.display());
    let handle = axon_broker::start(config).expect("Failed to start the broker");
    handle.wait();
}
