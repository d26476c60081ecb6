use std::error::Error;
use std::time::Duration;

use secrecy::SecretString;
use tracing_subscriber::EnvFilter;
use twitter_stream_sdk::auth::BearerToken;
use twitter_stream_sdk::config::StreamConfig;
use twitter_stream_sdk::error::StreamError;
use twitter_stream_sdk::stream::client::StreamFactory;
use twitter_stream_sdk::stream::listener::{
    ConnectionLifeCycleListener, Listener, StatusListener,
};
use twitter_stream_sdk::stream::proto::{StallWarning, Status, StatusDeletionNotice};

struct Printer;

impl StatusListener for Printer {
    fn on_status(&self, status: &Status) {
        let author = status
            .user
            .as_ref()
            .map(|user| user.screen_name.as_str())
            .unwrap_or("?");
        println!("@{author}: {}", status.display_text());
    }

    fn on_deletion_notice(&self, notice: &StatusDeletionNotice) {
        println!("deleted status_id={}", notice.status_id);
    }

    fn on_stall_warning(&self, warning: &StallWarning) {
        println!("stall warning {} ({}% full)", warning.code, warning.percent_full);
    }

    fn on_exception(&self, error: &StreamError) {
        eprintln!("stream error: {error}");
    }
}

struct Connection;

impl ConnectionLifeCycleListener for Connection {
    fn on_connect(&self) {
        println!("connected");
    }

    fn on_disconnect(&self) {
        println!("disconnected");
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let token = "REPLACE_WITH_BEARER_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let config = StreamConfig::default().with_stream_thread_name("sample-demo");
        let factory = StreamFactory::new(config, BearerToken::new(SecretString::new(token)))?;

        let stream = factory.instance();
        stream
            .add_listener(Listener::status(Printer))
            .add_connection_life_cycle_listener(Connection);
        stream.sample()?;

        tokio::time::sleep(Duration::from_secs(60)).await;
        stream.shutdown();

        Ok::<(), Box<dyn Error>>(())
    })
}
