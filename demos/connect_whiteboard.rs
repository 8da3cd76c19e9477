use std::error::Error;
use std::time::Duration;

use whiteboard_sdk::stream::client::TransportConfig;
use whiteboard_sdk::{DrawEvent, DrawEventType, WhiteboardClient};

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let endpoint = "ws://localhost:8080/ws/websocket".to_string();
    let username = "REPLACE_WITH_USERNAME".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = WhiteboardClient::new()
            .with_config(TransportConfig::new(
                endpoint,
                Duration::from_secs(4),
                Duration::from_secs(5),
            ))
            .with_status_handler(|status| {
                println!("state={:?} epoch={}", status.state, status.epoch);
            });

        let session = client
            .connect(
                username.as_str(),
                |event: DrawEvent| {
                    println!(
                        "draw user={} type={:?} x={:.3} y={:.3}",
                        event.username, event.kind, event.x, event.y
                    );
                },
                |events: Vec<DrawEvent>| {
                    println!("history events={}", events.len());
                },
            )
            .await?;

        let strokes = [
            (DrawEventType::Start, 0.25, 0.25),
            (DrawEventType::Draw, 0.50, 0.40),
            (DrawEventType::End, 0.75, 0.55),
        ];
        for (kind, x, y) in strokes {
            session.send_draw_event(DrawEvent::stroke(
                session.username(),
                kind,
                x,
                y,
                "#1e88e5",
                3.0,
            ))?;
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        session.disconnect();
        Ok::<(), Box<dyn Error>>(())
    })
}
