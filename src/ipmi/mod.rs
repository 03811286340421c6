//! IPMI-over-LAN sessions backing the session pools.
//!
//! `ipmi-rs` speaks RMCP/RMCP+ over a blocking UDP socket, so every open
//! session lives on its own worker thread (see [`worker`]) and the async
//! side only exchanges requests and replies with it.

mod command;
mod worker;

use crate::error::Error;
use crate::server::connection_pool::{Connector, Session};
use crate::target::Target;
use log::{debug, info};
use serde::{Serialize, Serializer};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IpmiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session activation failed: {0}")]
    Activation(String),

    #[error("IPMI command failed: {0}")]
    Command(String),

    #[error("Invalid power restore policy '{0}', expected always-on, previous or always-off")]
    InvalidPolicy(String),

    #[error("IPMI session worker has stopped")]
    WorkerGone,
}

/// What the BMC does once AC power comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerRestorePolicy {
    AlwaysOff,
    Previous,
    AlwaysOn,
}

impl PowerRestorePolicy {
    /// Encoding shared by Get Chassis Status (bits 5-6) and Set Power Restore Policy.
    pub fn code(self) -> u8 {
        match self {
            PowerRestorePolicy::AlwaysOff => 0,
            PowerRestorePolicy::Previous => 1,
            PowerRestorePolicy::AlwaysOn => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PowerRestorePolicy::AlwaysOff),
            1 => Some(PowerRestorePolicy::Previous),
            2 => Some(PowerRestorePolicy::AlwaysOn),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PowerRestorePolicy::AlwaysOff => "always-off",
            PowerRestorePolicy::Previous => "previous",
            PowerRestorePolicy::AlwaysOn => "always-on",
        }
    }
}

impl std::fmt::Display for PowerRestorePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PowerRestorePolicy {
    type Err = IpmiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always-off" => Ok(PowerRestorePolicy::AlwaysOff),
            "previous" => Ok(PowerRestorePolicy::Previous),
            "always-on" => Ok(PowerRestorePolicy::AlwaysOn),
            _ => Err(IpmiError::InvalidPolicy(s.to_string())),
        }
    }
}

impl Serialize for PowerRestorePolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Decoded Get Chassis Status response (IPMI v2.0, section 28.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChassisStatus {
    pub power_is_on: bool,
    pub power_overload: bool,
    pub interlock: bool,
    pub power_fault: bool,
    pub power_control_fault: bool,
    pub power_restore_policy: PowerRestorePolicy,

    pub last_power_on_by_command: bool,
    pub last_power_down_by_fault: bool,
    pub last_power_down_by_interlock: bool,
    pub last_power_down_by_overload: bool,
    pub ac_failed: bool,
}

impl ChassisStatus {
    pub fn from_data(data: &[u8]) -> Option<ChassisStatus> {
        // Current power state, last power event, misc state; the front
        // panel byte is optional.
        if data.len() < 3 {
            return None;
        }
        let (current, last) = (data[0], data[1]);
        Some(ChassisStatus {
            power_is_on: current & 0x01 != 0,
            power_overload: current & 0x02 != 0,
            interlock: current & 0x04 != 0,
            power_fault: current & 0x08 != 0,
            power_control_fault: current & 0x10 != 0,
            // 0b11 means "unknown"; report it like the BMC default.
            power_restore_policy: PowerRestorePolicy::from_code((current >> 5) & 0b11)
                .unwrap_or(PowerRestorePolicy::Previous),

            last_power_on_by_command: last & 0x10 != 0,
            last_power_down_by_fault: last & 0x08 != 0,
            last_power_down_by_interlock: last & 0x04 != 0,
            last_power_down_by_overload: last & 0x02 != 0,
            ac_failed: last & 0x01 != 0,
        })
    }
}

/// Chassis Control command argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChassisControl {
    PowerDown = 0,
    PowerUp = 1,
    PowerCycle = 2,
    HardReset = 3,
}

/// The operations the HTTP layer performs on a pooled session.
pub trait ChassisSession: Session {
    fn chassis_status(&mut self) -> impl Future<Output = Result<ChassisStatus, IpmiError>> + Send;

    fn chassis_control(
        &mut self,
        control: ChassisControl,
    ) -> impl Future<Output = Result<(), IpmiError>> + Send;

    fn set_power_restore_policy(
        &mut self,
        policy: PowerRestorePolicy,
    ) -> impl Future<Output = Result<(), IpmiError>> + Send;
}

/// Opens RMCP(+) sessions for the pools.
#[derive(Debug, Clone)]
pub struct IpmiConnector {
    timeout: Duration,
    rmcp_plus: bool,
}

impl IpmiConnector {
    pub fn new(timeout: Duration, rmcp_plus: bool) -> Self {
        Self { timeout, rmcp_plus }
    }
}

impl Connector for IpmiConnector {
    type Session = IpmiSession;
    type Error = IpmiError;

    async fn connect(&self, target: &Target) -> Result<IpmiSession, IpmiError> {
        let id = Uuid::new_v4();
        debug!("Activating session {} to {}", id, target);
        let worker = worker::Worker::spawn(target, self.timeout, self.rmcp_plus).await?;
        info!("IPMI session {} to {} established", id, target);
        Ok(IpmiSession {
            id,
            target: target.name.clone(),
            worker,
        })
    }
}

pub struct IpmiSession {
    id: Uuid,
    target: String,
    worker: worker::Worker,
}

impl Session for IpmiSession {
    async fn close(self) -> Result<(), Error> {
        debug!("Closing IPMI session {} to {}", self.id, self.target);
        self.worker.shutdown().await?;
        Ok(())
    }
}

impl ChassisSession for IpmiSession {
    async fn chassis_status(&mut self) -> Result<ChassisStatus, IpmiError> {
        self.worker.call(worker::Request::ChassisStatus).await
    }

    async fn chassis_control(&mut self, control: ChassisControl) -> Result<(), IpmiError> {
        info!("{}: chassis control {:?}", self.target, control);
        self.worker
            .call(|reply| worker::Request::ChassisControl(control, reply))
            .await
    }

    async fn set_power_restore_policy(
        &mut self,
        policy: PowerRestorePolicy,
    ) -> Result<(), IpmiError> {
        info!("{}: set power restore policy {}", self.target, policy);
        self.worker
            .call(|reply| worker::Request::SetPowerRestorePolicy(policy, reply))
            .await
    }
}
