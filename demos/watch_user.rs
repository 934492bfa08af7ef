//! Follows one user's stream and prints what arrives. On ctrl-c it prints
//! the most recent messages again, newest first.
//!
//! ```text
//! PROVIDER_SSE_ENDPOINT=http://127.0.0.1:8080 cargo run --example watch_user -- john
//! ```

use std::collections::VecDeque;
use std::error::Error;

use provider_sse_sdk::stream::client::{StreamClient, LOCAL_STREAM_ENDPOINT};
use provider_sse_sdk::stream::session::SessionOptions;
use secrecy::SecretString;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const HISTORY_LIMIT: usize = 200;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let user = std::env::args().nth(1).unwrap_or_else(|| "john".to_string());
    let endpoint = std::env::var("PROVIDER_SSE_ENDPOINT")
        .unwrap_or_else(|_| LOCAL_STREAM_ENDPOINT.to_string());

    let mut client = StreamClient::new().with_endpoint(endpoint);
    if let Ok(api_key) = std::env::var("PROVIDER_API_KEY") {
        client = client.with_api_key(SecretString::new(api_key));
    }

    let session = client.session(SessionOptions::default())?;
    let mut statuses = session.subscribe_status();
    let mut messages = session.subscribe_messages();
    session.connect(user.clone());

    // Newest first, trimmed to the display limit.
    let mut history: VecDeque<String> = VecDeque::with_capacity(HISTORY_LIMIT);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            status = statuses.recv() => match status {
                Ok(status) => info!(user = %user, status = %status, "status changed"),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            message = messages.recv() => match message {
                Ok(message) => {
                    println!("{message}");
                    history.push_front(message);
                    history.truncate(HISTORY_LIMIT);
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "message feed lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = &mut shutdown => break,
        }
    }

    session.disconnect();
    info!(kept = history.len(), "stopped watching");
    println!("--- last {} messages, newest first ---", history.len());
    for message in &history {
        println!("{message}");
    }
    Ok(())
}
