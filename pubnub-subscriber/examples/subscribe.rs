//! Subscribe to one or more channels and print what arrives.
//!
//! ```sh
//! cargo run -p pubnub-subscriber --example subscribe -- <SUBSCRIBE_KEY> <CHANNEL>[,<CHANNEL>...] [ORIGIN]
//! ```
//!
//! The subscribe key can also come from the environment:
//! ```sh
//! PUBNUB_SUBSCRIBE_KEY=demo cargo run -p pubnub-subscriber --example subscribe -- <CHANNELS>
//! ```
//!
//! Message payloads are printed to stdout (pipe to `jq` for formatting);
//! statuses and presence go to stderr.

use pubnub_subscriber::{Client, Configuration, Event, Listener, SubscribeRequest};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let env_key = std::env::var("PUBNUB_SUBSCRIBE_KEY").ok();

    let (subscribe_key, channels, origin) = if let Some(ref key) = env_key {
        let channels = args.first().ok_or("usage: subscribe <CHANNELS> [ORIGIN]")?;
        (key.as_str(), channels.as_str(), args.get(1).cloned())
    } else {
        let key = args
            .first()
            .ok_or("usage: subscribe <SUBSCRIBE_KEY> <CHANNELS> [ORIGIN]")?;
        let channels = args
            .get(1)
            .ok_or("usage: subscribe <SUBSCRIBE_KEY> <CHANNELS> [ORIGIN]")?;
        (key.as_str(), channels.as_str(), args.get(2).cloned())
    };

    let user_id = format!("example-{}", std::process::id());
    let mut config = Configuration::new(subscribe_key, user_id);
    config.origin = origin;
    config.presence_timeout = Some(60);

    let client = Client::new(config)?;
    let (listener, mut events) = Listener::channel(1024);
    client.add_listener(listener)?;
    client.subscribe(
        SubscribeRequest::new()
            .channels(channels.split(',').filter(|c| !c.is_empty()))
            .with_presence(),
    )?;
    eprintln!("subscribing to '{channels}' ...");

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                match event {
                    Event::Message(msg) | Event::Signal(msg) => {
                        eprintln!(
                            "[message] channel={} tt={} publisher={}",
                            msg.channel,
                            msg.timetoken,
                            msg.publisher.as_deref().unwrap_or("-"),
                        );
                        println!("{}", msg.payload);
                    }
                    Event::Presence(presence) => eprintln!(
                        "[presence] channel={} action={:?} uuid={} occupancy={}",
                        presence.channel,
                        presence.action,
                        presence.uuid.as_deref().unwrap_or("-"),
                        presence.occupancy,
                    ),
                    Event::Status(status) => {
                        eprintln!(
                            "[status] {:?} {}",
                            status.category,
                            status.error_data.as_deref().unwrap_or(""),
                        );
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if events.dropped() > 0 {
        eprintln!("dropped {} events under backpressure", events.dropped());
    }
    client.destroy();
    Ok(())
}
