use super::api_error::ApiError;
use super::connection_pool::{Connector, PoolError, PooledSession};
use super::{AppState, HOST_QUERY_CONCURRENCY};
use crate::ipmi::{ChassisControl, ChassisSession, IpmiError, PowerRestorePolicy};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
pub struct HostState {
    pub hostname: String,
    pub power_is_on: bool,
    pub power_restore_policy: PowerRestorePolicy,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum HostEntry {
    State(HostState),
    Error { error: String },
}

#[derive(Debug, Serialize)]
pub struct HostList {
    pub hosts: BTreeMap<String, HostEntry>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HostCommand {
    #[serde(default)]
    pub power: Option<bool>,
    #[serde(default)]
    pub power_restore_policy: Option<String>,
}

/// Acquire a session for `name`, giving up when the server shuts down.
async fn acquire<C>(state: &AppState<C>, name: &str) -> Result<PooledSession<C>, ApiError>
where
    C: Connector,
{
    match state
        .registry
        .acquire_with_cancel(name, &state.shutdown)
        .await
    {
        Ok(session) => Ok(session),
        Err(e) => {
            if let PoolError::Exhausted(_) = e {
                if let Some(stats) = state.registry.stats(name).await {
                    warn!(
                        "Session pool for {} exhausted: {} checked out, {} waiting, capacity {}",
                        name, stats.checked_out, stats.waiters, stats.capacity
                    );
                }
            }
            Err(e.into())
        }
    }
}

/// Read the chassis status of one host through its pool.
///
/// A session whose command failed is discarded rather than returned, the
/// BMC may have dropped it.
async fn query_host<C>(state: &AppState<C>, name: &str) -> Result<HostState, ApiError>
where
    C: Connector,
    C::Session: ChassisSession,
{
    let mut session = acquire(state, name).await?;
    match session.chassis_status().await {
        Ok(status) => {
            state.registry.release(session);
            Ok(HostState {
                hostname: name.to_string(),
                power_is_on: status.power_is_on,
                power_restore_policy: status.power_restore_policy,
            })
        }
        Err(e) => {
            session.discard();
            Err(e.into())
        }
    }
}

pub async fn list_hosts<C>(State(state): State<AppState<C>>) -> Json<HostList>
where
    C: Connector,
    C::Session: ChassisSession,
{
    let state = &state;
    let hosts = stream::iter(state.registry.targets())
        .map(|name| async move {
            let entry = match query_host(state, &name).await {
                Ok(host) => HostEntry::State(host),
                Err(e) => {
                    debug!("Host {} status unavailable: {}", name, e);
                    HostEntry::Error {
                        error: e.to_string(),
                    }
                }
            };
            (name, entry)
        })
        .buffer_unordered(HOST_QUERY_CONCURRENCY)
        .collect::<BTreeMap<_, _>>()
        .await;

    Json(HostList { hosts })
}

pub async fn get_host<C>(
    State(state): State<AppState<C>>,
    Path(hostname): Path<String>,
) -> Result<Json<HostState>, ApiError>
where
    C: Connector,
    C::Session: ChassisSession,
{
    query_host(&state, &hostname).await.map(Json)
}

pub async fn put_host<C>(
    State(state): State<AppState<C>>,
    Path(hostname): Path<String>,
    command: Result<Json<HostCommand>, JsonRejection>,
) -> Result<StatusCode, ApiError>
where
    C: Connector,
    C::Session: ChassisSession,
{
    let Json(command) = command?;
    let policy = command
        .power_restore_policy
        .as_deref()
        .map(str::parse::<PowerRestorePolicy>)
        .transpose()?;

    let mut session = acquire(&state, &hostname).await?;
    let result: Result<(), IpmiError> = async {
        if let Some(policy) = policy {
            info!(
                "Setting power restore policy of {} to {}",
                session.target(),
                policy
            );
            session.set_power_restore_policy(policy).await?;
        }
        if let Some(on) = command.power {
            info!(
                "Powering {} {}",
                session.target(),
                if on { "up" } else { "down" }
            );
            let control = if on {
                ChassisControl::PowerUp
            } else {
                ChassisControl::PowerDown
            };
            session.chassis_control(control).await?;
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            state.registry.release(session);
            Ok(StatusCode::NO_CONTENT)
        }
        Err(e) => {
            session.discard();
            Err(e.into())
        }
    }
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
