use futures::StreamExt;
use socket_pulse::{
    DeflateOptions, Event, PerMessageDeflate, ReconnectPolicy, WSClient, WebSocketConfig,
};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

// A client that offers permessage-deflate, reconnects on failures and
// prints every event the engine raises.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = WebSocketConfig {
        ping_interval: Duration::from_secs(15),
        pong_timeout: Duration::from_secs(5),
        extensions: vec![Arc::new(PerMessageDeflate::new(DeflateOptions::default())?)],
        reconnect: ReconnectPolicy {
            max_retries: -1,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            ..Default::default()
        },
        ..Default::default()
    };

    let (client, mut events) = WSClient::connect("ws://localhost:9001", config).await?;
    client.send_text("ready when you are").await?;

    while let Some(event) = events.next().await {
        match event {
            Event::Message(id, message) => println!("[{}] message: {:?}", id, message),
            Event::Reconnecting { attempt, delay } => {
                println!("reconnect attempt {} in {:?}", attempt, delay)
            }
            Event::Closed { code, reason } => {
                println!("closed with {:?} {}", code, reason);
                break;
            }
            other => println!("{:?}", other),
        }
    }
    Ok(())
}
