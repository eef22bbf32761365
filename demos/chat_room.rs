use std::error::Error;
use std::sync::Arc;

use iot_session_sdk::broker::IotWebSocketConnector;
use iot_session_sdk::identity::CognitoIdentityClient;
use iot_session_sdk::session::{SessionEvent, SessionManager};
use iot_session_sdk::SessionConfig;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

// IOT_SESSION_REGION=us-east-1 \
// IOT_SESSION_IDENTITY_POOL_ID=us-east-1:REPLACE_WITH_POOL_ID \
// IOT_SESSION_ENDPOINT=REPLACE_WITH_PREFIX-ats.iot.us-east-1.amazonaws.com \
// cargo run --example chat_room -- room1 alice
fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let room = args.next().unwrap_or_else(|| "room1".to_string());
    let name = args.next().unwrap_or_else(|| "anonymous".to_string());

    let config = SessionConfig::from_env()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let identity = CognitoIdentityClient::new(&config.region, &config.identity_pool_id)?;
        let connector = IotWebSocketConnector::new(&config.endpoint);
        let mut session = SessionManager::new(config, Arc::new(identity), Arc::new(connector))
            .with_observer(|payload| {
                let from = payload.get("from").and_then(|v| v.as_str()).unwrap_or("?");
                let message = payload
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                println!("<{from}> {message}");
            })
            .with_error_reporter(|err| eprintln!("session error: {err}"));

        session.initialize().await?;
        session.set_topic(&room)?;
        println!("joined {room} as {name}; type a line to publish, ctrl-d to quit");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) if !line.trim().is_empty() => session.publish(&name, line.trim())?,
                    Some(_) => {}
                    None => break,
                },
                event = session.recv() => match event {
                    Some(SessionEvent::Connected) => println!("connected"),
                    Some(SessionEvent::Reconnecting) => println!("reconnecting..."),
                    Some(_) => {}
                    None => break,
                },
            }
        }

        if let Err(err) = session.close() {
            eprintln!("close failed: {err}");
        }
        Ok::<(), Box<dyn Error>>(())
    })
}
