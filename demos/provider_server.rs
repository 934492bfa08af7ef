//! Minimal SSE provider to run sessions against.
//!
//! Every `GET /sse/{user}` stream receives `tick` events: a `connected`
//! greeting on subscribe, a shared `time=<unix ms>` broadcast every 5s, and a
//! per-stream heartbeat every 15s. A user's channel is removed once its last
//! subscriber goes away.
//!
//! ```text
//! PROVIDER_LISTEN_ADDR=127.0.0.1:8080 cargo run --example provider_server
//! ```

use std::collections::HashMap;
use std::convert::Infallible;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream;
use provider_sse_sdk::stream::proto::TICK_EVENT;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, interval_at, Instant, Interval};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const TICK_PERIOD: Duration = Duration::from_secs(5);
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(15);
const HEARTBEAT: &str = "::heartbeat::";
const CHANNEL_CAPACITY: usize = 256;

struct UserChannel {
    sender: broadcast::Sender<String>,
    subscribers: usize,
}

/// Per-user broadcast channels.
#[derive(Clone, Default)]
struct Channels {
    inner: Arc<Mutex<HashMap<String, UserChannel>>>,
}

impl Channels {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, UserChannel>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn join(&self, user: &str) -> broadcast::Receiver<String> {
        let mut channels = self.lock();
        let channel = channels
            .entry(user.to_string())
            .or_insert_with(|| UserChannel {
                sender: broadcast::channel(CHANNEL_CAPACITY).0,
                subscribers: 0,
            });
        channel.subscribers += 1;
        channel.sender.subscribe()
    }

    fn leave(&self, user: &str) {
        let mut channels = self.lock();
        let Some(channel) = channels.get_mut(user) else {
            return;
        };
        channel.subscribers = channel.subscribers.saturating_sub(1);
        if channel.subscribers == 0 {
            channels.remove(user);
            debug!(event = "user_channel_removed", user);
        }
    }

    fn emit_to_user(&self, user: &str, message: &str) {
        if let Some(channel) = self.lock().get(user) {
            let _ = channel.sender.send(message.to_string());
        }
    }

    fn emit_to_all(&self, message: &str) -> usize {
        let channels = self.lock();
        for channel in channels.values() {
            let _ = channel.sender.send(message.to_string());
        }
        channels.len()
    }

    fn shutdown(&self) {
        let mut channels = self.lock();
        info!(channels = channels.len(), "completing sse channels");
        // Dropping the senders ends every open stream.
        channels.clear();
    }
}

/// Leaves the user's channel when the response stream is dropped.
struct Membership {
    channels: Channels,
    user: String,
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.channels.leave(&self.user);
    }
}

struct UserStream {
    receiver: broadcast::Receiver<String>,
    heartbeat: Interval,
    _membership: Membership,
}

async fn sse_handler(
    Path(user): Path<String>,
    State(channels): State<Channels>,
) -> impl IntoResponse {
    let receiver = channels.join(&user);
    info!(user = %user, "stream subscribed");
    channels.emit_to_user(&user, "connected");

    let state = UserStream {
        receiver,
        heartbeat: interval_at(Instant::now() + HEARTBEAT_PERIOD, HEARTBEAT_PERIOD),
        _membership: Membership {
            channels: channels.clone(),
            user,
        },
    };

    let events = stream::unfold(state, |mut state| async move {
        loop {
            let data = tokio::select! {
                next = state.receiver.recv() => match next {
                    Ok(data) => data,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                },
                _ = state.heartbeat.tick() => HEARTBEAT.to_string(),
            };
            let event = Event::default().event(TICK_EVENT).data(data);
            return Some((Ok::<_, Infallible>(event), state));
        }
    });

    Sse::new(events)
}

fn unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

async fn run_ticker(channels: Channels) {
    let mut ticker = interval(TICK_PERIOD);
    loop {
        ticker.tick().await;
        let message = format!("time={}", unix_ms());
        let users = channels.emit_to_all(&message);
        if users > 0 {
            debug!(event = "tick_emitted", users, message = %message);
        }
    }
}

fn listen_addr() -> Result<SocketAddr, Box<dyn Error>> {
    Ok(std::env::var("PROVIDER_LISTEN_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = listen_addr()?;
    let channels = Channels::default();
    tokio::spawn(run_ticker(channels.clone()));

    let app = Router::new()
        .route("/sse/{user}", get(sse_handler))
        .with_state(channels.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "provider listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            channels.shutdown();
        })
        .await?;

    Ok(())
}
