//! HTTP API over the light channels.
//!
//! ```text
//! GET /lights                  current levels
//! PUT /lights                  set levels now
//! PUT /lights/ramp             ramp levels over `duration` seconds
//! PUT /lights/sequence/{name}  start startup | blink | random | dawn
//! ```
//!
//! Parameters come from the query string or a form-encoded body.

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, RawQuery, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::channel::ChannelName;
use crate::channel_set::ChannelSet;

/// Longest ramp a request may ask for, in seconds.
pub const MAX_RAMP_SECONDS: i64 = 60;

/// Most blink rounds a sequence request may ask for.
pub const MAX_BLINK_COUNT: i64 = 100;

#[derive(Clone)]
struct AppState {
    lights: Arc<ChannelSet>,
}

pub fn router(lights: Arc<ChannelSet>) -> Router {
    Router::new()
        .route("/lights", get(get_lights).put(put_lights))
        .route("/lights/ramp", put(put_ramp))
        .route("/lights/sequence/:name", put(put_sequence))
        .layer(middleware::from_fn(log_request))
        .with_state(AppState { lights })
}

/// Serve the API until the listener fails.
pub async fn serve(listener: TcpListener, lights: Arc<ChannelSet>) -> Result<()> {
    info!(
        "🌐 HTTP API listening on {}",
        listener.local_addr().context("Listener has no address")?
    );
    axum::serve(listener, router(lights))
        .await
        .context("HTTP server failed")
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let response = next.run(request).await;
    debug!("{} {} -> {}", method, uri, response.status().as_u16());
    response
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(err: impl fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!("Request failed: {}", self.message);
        }
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

/// Query string and form body parameters, the body taking precedence.
#[derive(Debug, Default)]
struct Params(HashMap<String, String>);

impl Params {
    fn parse(query: Option<&str>, body: &[u8]) -> Result<Self, ApiError> {
        let mut values = HashMap::new();
        if let Some(query) = query {
            values.extend(Self::decode(query.as_bytes())?);
        }
        if !body.is_empty() {
            values.extend(Self::decode(body)?);
        }
        // Blank values count as absent
        values.retain(|_, v| !v.trim().is_empty());
        Ok(Self(values))
    }

    fn decode(input: &[u8]) -> Result<Vec<(String, String)>, ApiError> {
        serde_urlencoded::from_bytes(input)
            .map_err(|e| ApiError::bad_request(format!("Malformed parameters: {}", e)))
    }

    fn int(&self, key: &str) -> Result<Option<i64>, ApiError> {
        let Some(value) = self.0.get(key) else {
            return Ok(None);
        };
        value.trim().parse().map(Some).map_err(|_| {
            ApiError::bad_request(format!("Parameter '{}' must be an integer, got '{}'", key, value))
        })
    }

    fn required_int(&self, key: &str) -> Result<i64, ApiError> {
        self.int(key)?
            .ok_or_else(|| ApiError::bad_request(format!("Missing required parameter '{}'", key)))
    }

    /// Requested level per channel, clamped into that channel's bounds.
    fn targets(&self, lights: &ChannelSet) -> Result<Targets, ApiError> {
        let mut targets = Targets::default();
        for name in ChannelName::ALL {
            if let Some(level) = self.int(name.as_str())? {
                targets.set(name, lights.channel(name).bounds().clamp(level));
            }
        }
        Ok(targets)
    }
}

/// Per-channel levels of a request. Absent channels serialize as `null`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
struct Targets {
    red: Option<u8>,
    green: Option<u8>,
    blue: Option<u8>,
    white: Option<u8>,
}

impl Targets {
    fn get(&self, name: ChannelName) -> Option<u8> {
        match name {
            ChannelName::Red => self.red,
            ChannelName::Green => self.green,
            ChannelName::Blue => self.blue,
            ChannelName::White => self.white,
        }
    }

    fn set(&mut self, name: ChannelName, level: u8) {
        let slot = match name {
            ChannelName::Red => &mut self.red,
            ChannelName::Green => &mut self.green,
            ChannelName::Blue => &mut self.blue,
            ChannelName::White => &mut self.white,
        };
        *slot = Some(level);
    }
}

#[derive(Debug, Serialize)]
struct RampResponse {
    duration: i64,
    #[serde(flatten)]
    targets: Targets,
}

async fn get_lights(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.lights.levels())
}

async fn put_lights(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Json<Targets>, ApiError> {
    let params = Params::parse(query.as_deref(), &body)?;
    let targets = params.targets(&state.lights)?;

    // A ramp in progress on a channel holds that channel until it finishes
    let lights = Arc::clone(&state.lights);
    tokio::task::spawn_blocking(move || {
        for name in ChannelName::ALL {
            if let Some(level) = targets.get(name) {
                lights.channel(name).set_level(level);
            }
        }
    })
    .await
    .map_err(ApiError::internal)?;

    Ok(Json(targets))
}

async fn put_ramp(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Json<RampResponse>, ApiError> {
    let params = Params::parse(query.as_deref(), &body)?;
    let duration = params.required_int("duration")?;
    if !(0..=MAX_RAMP_SECONDS).contains(&duration) {
        return Err(ApiError::bad_request(format!(
            "Parameter 'duration' must be between 0 and {} seconds, got {}",
            MAX_RAMP_SECONDS, duration
        )));
    }
    let targets = params.targets(&state.lights)?;
    let total = Duration::from_secs(duration as u64);

    let lights = Arc::clone(&state.lights);
    tokio::task::spawn_blocking(move || {
        thread::scope(|scope| {
            for name in ChannelName::ALL {
                if let Some(level) = targets.get(name) {
                    let channel = lights.channel(name);
                    scope.spawn(move || channel.ramp_to(level, total));
                }
            }
        });
    })
    .await
    .map_err(ApiError::internal)?;

    Ok(Json(RampResponse { duration, targets }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sequence {
    Startup,
    Blink(usize),
    Random,
    Dawn,
}

impl Sequence {
    fn from_request(name: &str, params: &Params) -> Result<Self, ApiError> {
        match name {
            "startup" => Ok(Sequence::Startup),
            "blink" => {
                let count = params.int("count")?.unwrap_or(1);
                if !(0..=MAX_BLINK_COUNT).contains(&count) {
                    return Err(ApiError::bad_request(format!(
                        "Parameter 'count' must be between 0 and {}, got {}",
                        MAX_BLINK_COUNT, count
                    )));
                }
                Ok(Sequence::Blink(count as usize))
            }
            "random" => Ok(Sequence::Random),
            "dawn" => Ok(Sequence::Dawn),
            other => Err(ApiError::not_found(format!("Unknown sequence '{}'", other))),
        }
    }

    fn run(self, lights: &ChannelSet) {
        match self {
            Sequence::Startup => lights.startup_sequence(),
            Sequence::Blink(count) => lights.blink_cycle(count),
            Sequence::Random => {
                if let Err(e) = lights.randomize_all() {
                    error!("Random sequence failed: {:?}", e);
                }
            }
            Sequence::Dawn => lights.dawn_sequence(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SequenceStarted {
    sequence: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<usize>,
}

async fn put_sequence(
    State(state): State<AppState>,
    Path(name): Path<String>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<(StatusCode, Json<SequenceStarted>), ApiError> {
    let params = Params::parse(query.as_deref(), &body)?;
    let sequence = Sequence::from_request(&name, &params)?;
    info!("Starting {:?} sequence on request", sequence);

    let lights = Arc::clone(&state.lights);
    // Detached: sequences can run for many minutes
    drop(tokio::task::spawn_blocking(move || sequence.run(&lights)));

    let count = match sequence {
        Sequence::Blink(count) => Some(count),
        _ => None,
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(SequenceStarted {
            sequence: name,
            count,
        }),
    ))
}
