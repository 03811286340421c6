use super::{Connector, Session};
use crate::error::Error;
use crate::ipmi::{ChassisControl, ChassisSession, ChassisStatus, IpmiError, PowerRestorePolicy};
use crate::target::Target;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type PowerTable = Arc<Mutex<HashMap<String, (bool, PowerRestorePolicy)>>>;

/// In-memory stand-in for a fleet of BMCs.
#[derive(Default)]
pub(crate) struct MockConnector {
    connects: AtomicUsize,
    failing_connects: AtomicUsize,
    closes: Arc<AtomicUsize>,
    next_id: AtomicUsize,
    delays: HashMap<String, Duration>,
    unreachable: HashSet<String>,
    broken_commands: HashSet<String>,
    close_fails: bool,
    close_delay: Option<Duration>,
    power: PowerTable,
}

impl MockConnector {
    pub(crate) fn with_delay(mut self, target: &str, delay: Duration) -> Self {
        self.delays.insert(target.to_string(), delay);
        self
    }

    pub(crate) fn with_unreachable(mut self, target: &str) -> Self {
        self.unreachable.insert(target.to_string());
        self
    }

    pub(crate) fn with_broken_commands(mut self, target: &str) -> Self {
        self.broken_commands.insert(target.to_string());
        self
    }

    pub(crate) fn with_close_failure(mut self) -> Self {
        self.close_fails = true;
        self
    }

    pub(crate) fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = Some(delay);
        self
    }

    pub(crate) fn fail_next_connects(&self, n: usize) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Connect attempts so far, failed ones included.
    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn power_of(&self, target: &str) -> Option<(bool, PowerRestorePolicy)> {
        self.power.lock().unwrap().get(target).copied()
    }

    /// Wait for detached closes to land.
    pub(crate) async fn wait_for_closes(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.closes() < n {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("sessions were not closed in time");
    }
}

impl Connector for MockConnector {
    type Session = MockSession;
    type Error = IpmiError;

    async fn connect(&self, target: &Target) -> Result<MockSession, IpmiError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(&target.name) {
            tokio::time::sleep(*delay).await;
        }
        let fail_now = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail_now || self.unreachable.contains(&target.name) {
            return Err(IpmiError::Activation(format!(
                "no response from {}:{}",
                target.address, target.port
            )));
        }
        Ok(MockSession {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            target: target.name.clone(),
            closes: self.closes.clone(),
            close_fails: self.close_fails,
            close_delay: self.close_delay,
            broken: self.broken_commands.contains(&target.name),
            power: self.power.clone(),
        })
    }
}

pub(crate) struct MockSession {
    id: usize,
    target: String,
    closes: Arc<AtomicUsize>,
    close_fails: bool,
    close_delay: Option<Duration>,
    broken: bool,
    power: PowerTable,
}

impl MockSession {
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    fn check(&self) -> Result<(), IpmiError> {
        if self.broken {
            return Err(IpmiError::Command(format!(
                "{}: completion code 0xC3 (timeout)",
                self.target
            )));
        }
        Ok(())
    }
}

impl Session for MockSession {
    async fn close(self) -> Result<(), Error> {
        if let Some(delay) = self.close_delay {
            tokio::time::sleep(delay).await;
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.close_fails {
            return Err(Error::Server(format!("session {} already gone", self.id)));
        }
        Ok(())
    }
}

impl ChassisSession for MockSession {
    async fn chassis_status(&mut self) -> Result<ChassisStatus, IpmiError> {
        self.check()?;
        let (on, policy) = self
            .power
            .lock()
            .unwrap()
            .get(&self.target)
            .copied()
            .unwrap_or((false, PowerRestorePolicy::Previous));
        let byte0 = u8::from(on) | (policy.code() << 5);
        Ok(ChassisStatus::from_data(&[byte0, 0, 0, 0]).unwrap())
    }

    async fn chassis_control(&mut self, control: ChassisControl) -> Result<(), IpmiError> {
        self.check()?;
        let mut power = self.power.lock().unwrap();
        let entry = power
            .entry(self.target.clone())
            .or_insert((false, PowerRestorePolicy::Previous));
        match control {
            ChassisControl::PowerUp | ChassisControl::PowerCycle | ChassisControl::HardReset => {
                entry.0 = true
            }
            ChassisControl::PowerDown => entry.0 = false,
        }
        Ok(())
    }

    async fn set_power_restore_policy(
        &mut self,
        policy: PowerRestorePolicy,
    ) -> Result<(), IpmiError> {
        self.check()?;
        let mut power = self.power.lock().unwrap();
        power
            .entry(self.target.clone())
            .or_insert((false, PowerRestorePolicy::Previous))
            .1 = policy;
        Ok(())
    }
}
