use std::fmt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;

/// Workload status reported to whatever drives the agent while a pass runs. `End` closes the
/// stream so a receiving task knows to stop.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum ChassisStatus {
    Maintenance(String),
    Active(String),
    Blocked(String),
    End,
}

impl fmt::Display for ChassisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChassisStatus::Maintenance(message) => write!(f, "maintenance: {message}"),
            ChassisStatus::Active(message) => write!(f, "active: {message}"),
            ChassisStatus::Blocked(message) => write!(f, "blocked: {message}"),
            ChassisStatus::End => f.write_str("end"),
        }
    }
}

pub type StatusSender = Sender<ChassisStatus>;

/// Send a status update if anyone is listening. A receiver that went away is not an error, status is
/// a side channel.
pub async fn report_status(sender: Option<&StatusSender>, status: ChassisStatus) {
    tracing::debug!("status {status}");
    if let Some(sender) = sender {
        let _ = sender.send(status).await;
    }
}
