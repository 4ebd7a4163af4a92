use socket_pulse::{TcpTransport, WSConnection, WebSocketConfig};
use std::error::Error;

// Connects to a local echo server, sends a couple of messages and closes
// cleanly. Run an echo server on 9001 first, e.g. any RFC 6455 echo.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let transport = TcpTransport::new();
    let conn = WSConnection::connect(
        "ws://localhost:9001",
        &transport,
        WebSocketConfig::default(),
    )
    .await?;

    conn.send_text("hello over socket-pulse").await?;
    conn.send_binary(vec![0xDE, 0xAD, 0xBE, 0xEF]).await?;

    for _ in 0..2 {
        let message = conn.receive().await?;
        println!("echoed back: {:?}", message);
    }

    println!("metrics: {:#?}", conn.metrics());
    conn.close(1000, "done").await?;
    Ok(())
}
