//! Operator control socket.
//!
//! The supervisor exposes a Unix socket that accepts one JSON request per
//! connection. The `ctl` subcommand uses [`ControlClient`] to talk to it.

mod client;
mod server;
mod types;

pub use client::{ControlClient, DEFAULT_TIMEOUT};
pub use server::{ControlServer, ServerHandle};
pub use types::{AdminRequest, AdminResponse, ControlError};

use crate::supervisor::{Supervisor, SupervisorError};

/// Carry out an operator request against the running supervisor.
pub async fn handle_request(supervisor: &Supervisor, request: AdminRequest) -> AdminResponse {
    let result: Result<(), SupervisorError> = match request {
        AdminRequest::Logs => {
            return AdminResponse::Logs {
                lines: supervisor.logs(),
            }
        }
        AdminRequest::Disconnect { reason } => supervisor.disconnect(reason).await,
        AdminRequest::Reconnect => supervisor.reconnect().await,
        AdminRequest::Chat { message } => {
            if message.trim().is_empty() {
                return AdminResponse::Error {
                    message: "chat message is empty".to_string(),
                };
            }
            supervisor.chat(message).await
        }
    };

    match result {
        Ok(()) => AdminResponse::Ok,
        Err(e) => AdminResponse::Error {
            message: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use crate::supervisor::ChildSpec;

    fn idle_supervisor() -> Supervisor {
        Supervisor::with_spec(ChildSpec::new("/bin/true"), SupervisorConfig::default())
    }

    #[tokio::test]
    async fn commands_without_a_child_report_an_error() {
        let supervisor = idle_supervisor();
        let response = handle_request(&supervisor, AdminRequest::Reconnect).await;
        assert_eq!(
            response,
            AdminResponse::Error {
                message: SupervisorError::NoChild.to_string()
            }
        );
    }

    #[tokio::test]
    async fn logs_are_served_without_a_child() {
        let supervisor = idle_supervisor();
        let response = handle_request(&supervisor, AdminRequest::Logs).await;
        assert_eq!(response, AdminResponse::Logs { lines: Vec::new() });
    }

    #[tokio::test]
    async fn empty_chat_is_refused() {
        let supervisor = idle_supervisor();
        let response = handle_request(
            &supervisor,
            AdminRequest::Chat {
                message: "  ".to_string(),
            },
        )
        .await;
        assert!(matches!(response, AdminResponse::Error { .. }));
    }
}
