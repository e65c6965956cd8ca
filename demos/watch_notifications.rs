use std::error::Error;
use std::sync::Arc;

use benefits_notify::api::NotificationsApiClient;
use benefits_notify::bridge::{InMemoryCache, NotificationCacheBridge, QueryCache, UNREAD_COUNT_KEY};
use benefits_notify::config::PortalConfig;
use benefits_notify::stream::client::{StreamClient, StreamEvent};
use benefits_notify::MountedStream;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // PORTAL_API_BASE_URL and PORTAL_SESSION_COOKIE select the portal and user.
    let config = PortalConfig::from_env()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let cache = Arc::new(InMemoryCache::new());
        let shared: Arc<dyn QueryCache> = cache.clone();
        let bridge = NotificationCacheBridge::new(shared).with_notification_callback(|event| {
            println!("[{}] {}: {}", event.category, event.title, event.body);
        });

        let api = NotificationsApiClient::new(&config)?;
        let _poller = config
            .unread_poll_interval
            .map(|interval| bridge.spawn_unread_poller(api.clone(), interval));

        let client = StreamClient::from_config(&config)?;
        let mut events = client.events();
        let _mounted = MountedStream::mount_with_bridge(client, &bridge);

        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::StateChanged(state) => println!("stream {state}"),
                StreamEvent::Notification(_) => {
                    let unread = cache.get(UNREAD_COUNT_KEY).unwrap_or_default();
                    println!("unread={unread}");
                }
                StreamEvent::Error(err) => eprintln!("stream error: {err}"),
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
