use std::error::Error;

use secrecy::SecretString;
use tracing_subscriber::EnvFilter;
use twitter_stream_sdk::auth::BearerToken;
use twitter_stream_sdk::config::StreamConfig;
use twitter_stream_sdk::stream::client::{FilterLevel, FilterQuery, StreamFactory};
use twitter_stream_sdk::stream::listener::{Listener, RawStreamListener};

struct RawPrinter;

impl RawStreamListener for RawPrinter {
    fn on_message(&self, raw: &str) {
        println!("{raw}");
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let token = "REPLACE_WITH_BEARER_TOKEN".to_string();
    let keywords = ["rustlang", "tokio"];

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let factory = StreamFactory::new(
            StreamConfig::default(),
            BearerToken::new(SecretString::new(token)),
        )?;

        let stream = factory.instance();
        stream
            .add_listener(Listener::raw(RawPrinter))
            .on_status(|status| println!("matched status {}", status.id))
            .on_exception(|error| eprintln!("stream error: {error}"));
        stream.filter(
            &FilterQuery::new()
                .track(keywords)
                .language(["en"])
                .filter_level(FilterLevel::Low),
        )?;

        tokio::signal::ctrl_c().await?;
        stream.shutdown();

        Ok::<(), Box<dyn Error>>(())
    })
}
