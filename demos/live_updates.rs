use std::error::Error;
use std::time::Duration;

use actionwire::live::{ModelChangeEvent, ResourceRef};
use actionwire::{Connection, ConnectionOptions};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let instance_id = "REPLACE_WITH_INSTANCE_ID".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let connection = Connection::new(ConnectionOptions::default())?;
        let instance = connection.live(ResourceRef::new("instance", instance_id));

        let listener = instance
            .change_event()
            .subscribe_fn(|change: &ModelChangeEvent, _| {
                println!("event={} id={} data={}", change.event, change.id, change.data);
            });

        tokio::time::sleep(Duration::from_secs(30)).await;

        listener.unsubscribe();
        println!("subscribed={}", instance.is_subscribed());
        connection.dispose();
        Ok::<(), Box<dyn Error>>(())
    })
}
