//! Email collaborator used by the script `sendEmail` builtin.

use crate::error::AppError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub from: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailReceipt {
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
    pub envelope: Value,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: EmailMessage) -> Result<EmailReceipt, AppError>;
}

/// Sender that only logs. Accepts every address that looks like one.
#[derive(Clone, Debug, Default)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, message: EmailMessage) -> Result<EmailReceipt, AppError> {
        let (accepted, rejected): (Vec<String>, Vec<String>) =
            message.to.iter().cloned().partition(|addr| addr.contains('@'));
        tracing::info!(
            to = ?accepted,
            rejected = ?rejected,
            subject = %message.subject,
            "email (log sender)"
        );
        Ok(EmailReceipt {
            envelope: json!({ "from": message.from, "to": accepted }),
            accepted,
            rejected,
        })
    }
}
