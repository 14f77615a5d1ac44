use std::error::Error;
use std::time::Duration;

use actionwire::{Connection, ConnectionOptions};
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let options = match std::env::args().nth(1) {
        Some(path) => ConnectionOptions::from_file(path)?,
        None => ConnectionOptions::default(),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let connection = Connection::new(options)?;
        connection.connectivity_changed().subscribe_fn(|change, _| {
            println!("socket_connection={}", change.socket_connection);
        });

        // first call usually goes over http while the socket is still opening
        let health = connection.perform("core:health", json!({})).await;
        println!("health={health:?}");

        tokio::time::sleep(Duration::from_millis(500)).await;
        match connection.perform("core:health", json!({})).await {
            Ok(value) => println!("socket_connected={} health={value}", connection.socket_connected()),
            Err(err) => println!("error={}", err.to_envelope()),
        }

        connection.dispose();
        Ok::<(), Box<dyn Error>>(())
    })
}
