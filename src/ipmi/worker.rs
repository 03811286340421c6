use super::command::{GetChassisStatus, SetChassisControl, SetPowerRestorePolicy};
use super::{ChassisControl, ChassisStatus, IpmiError, PowerRestorePolicy};
use crate::target::Target;
use crossbeam_channel::{Receiver, Sender};
use ipmi_rs::connection::rmcp::Rmcp;
use ipmi_rs::Ipmi;
use log::{debug, trace, warn};
use std::time::Duration;
use tokio::sync::oneshot;

type Reply<T> = oneshot::Sender<Result<T, IpmiError>>;

pub(super) enum Request {
    ChassisStatus(Reply<ChassisStatus>),
    ChassisControl(ChassisControl, Reply<()>),
    SetPowerRestorePolicy(PowerRestorePolicy, Reply<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the thread owning one activated RMCP session.
pub(super) struct Worker {
    tx: Sender<Request>,
}

impl Worker {
    /// Start the thread and wait until the session is activated.
    pub(super) async fn spawn(
        target: &Target,
        timeout: Duration,
        rmcp_plus: bool,
    ) -> Result<Self, IpmiError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = oneshot::channel();

        let address = target.address.clone();
        let port = target.port;
        let username = target.username.clone();
        let password = target.password().as_bytes().to_vec();

        std::thread::Builder::new()
            .name(format!("ipmi-{}", target.name))
            .spawn(move || {
                if ready_tx.is_closed() {
                    debug!("{}: connect abandoned before activation", address);
                    return;
                }
                let ipmi = match activate(&address, port, timeout, rmcp_plus, &username, &password)
                {
                    Ok(ipmi) => ipmi,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Some(ipmi) = report_ready(ready_tx, ipmi, &address) {
                    serve(ipmi, rx, &address);
                }
            })?;

        ready_rx.await.map_err(|_| IpmiError::WorkerGone)??;
        Ok(Self { tx })
    }

    pub(super) async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Request,
    ) -> Result<T, IpmiError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| IpmiError::WorkerGone)?;
        rx.await.map_err(|_| IpmiError::WorkerGone)?
    }

    pub(super) async fn shutdown(self) -> Result<(), IpmiError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Request::Shutdown(done))
            .map_err(|_| IpmiError::WorkerGone)?;
        rx.await.map_err(|_| IpmiError::WorkerGone)
    }
}

/// Hand a freshly activated session to the waiting `connect`, if it is still there.
fn report_ready<T>(
    ready_tx: oneshot::Sender<Result<(), IpmiError>>,
    session: T,
    address: &str,
) -> Option<T> {
    if ready_tx.send(Ok(())).is_err() {
        // Nobody owns the handle; the BMC expires the session on its own.
        warn!(
            "{}: connect abandoned after activation, dropping session",
            address
        );
        return None;
    }
    Some(session)
}

fn activate(
    address: &str,
    port: u16,
    timeout: Duration,
    rmcp_plus: bool,
    username: &str,
    password: &[u8],
) -> Result<Ipmi<Rmcp>, IpmiError> {
    let mut rmcp = Rmcp::new((address, port), timeout)?;
    rmcp.activate(rmcp_plus, Some(username), Some(password))
        .map_err(|e| IpmiError::Activation(format!("{}:{}: {:?}", address, port, e)))?;
    Ok(Ipmi::new(rmcp))
}

fn serve(mut ipmi: Ipmi<Rmcp>, rx: Receiver<Request>, address: &str) {
    // Ends when the handle is dropped or asks for shutdown.
    for request in rx.iter() {
        match request {
            Request::ChassisStatus(reply) => {
                trace!("{}: get chassis status", address);
                let res = ipmi
                    .send_recv(GetChassisStatus)
                    .map_err(|e| IpmiError::Command(format!("get chassis status: {:?}", e)));
                let _ = reply.send(res);
            }
            Request::ChassisControl(control, reply) => {
                let res = ipmi
                    .send_recv(SetChassisControl(control))
                    .map_err(|e| IpmiError::Command(format!("chassis control: {:?}", e)));
                let _ = reply.send(res);
            }
            Request::SetPowerRestorePolicy(policy, reply) => {
                let res = ipmi
                    .send_recv(SetPowerRestorePolicy(policy))
                    .map(|_| ())
                    .map_err(|e| {
                        IpmiError::Command(format!("set power restore policy: {:?}", e))
                    });
                let _ = reply.send(res);
            }
            Request::Shutdown(done) => {
                drop(ipmi);
                debug!("{}: session worker stopped", address);
                let _ = done.send(());
                return;
            }
        }
    }
    warn!("{}: session handle dropped without shutdown", address);
}
