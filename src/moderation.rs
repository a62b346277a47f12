//! Asynchronous media moderation.
//!
//! New image and video attachments are queued as jobs after their message is
//! stored. A single worker hands each job to the [`Classifier`] collaborator
//! and writes the verdict back through the [`PersistenceBridge`]. Failed
//! classifications are recorded as `error` and retried a bounded number of
//! times.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::chat::{MediaKind, Message, MessageId};
use crate::config::ModerationConfig;
use crate::persistence::PersistenceBridge;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Pending,
    Approved,
    Rejected,
    Error,
}

impl VerdictStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VerdictStatus::Pending => "pending",
            VerdictStatus::Approved => "approved",
            VerdictStatus::Rejected => "rejected",
            VerdictStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(VerdictStatus::Pending),
            "approved" => Some(VerdictStatus::Approved),
            "rejected" => Some(VerdictStatus::Rejected),
            "error" => Some(VerdictStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationVerdict {
    pub status: VerdictStatus,
    pub confidence: f64,
    pub categories: BTreeMap<String, f64>,
    pub detail: Option<String>,
    pub moderated_at: Option<DateTime<Utc>>,
}

impl ModerationVerdict {
    pub fn pending() -> Self {
        ModerationVerdict {
            status: VerdictStatus::Pending,
            confidence: 0.0,
            categories: BTreeMap::new(),
            detail: None,
            moderated_at: None,
        }
    }

    pub fn from_classification(classification: Classification) -> Self {
        ModerationVerdict {
            status: if classification.is_safe {
                VerdictStatus::Approved
            } else {
                VerdictStatus::Rejected
            },
            confidence: classification.confidence.clamp(0.0, 1.0),
            categories: classification.categories,
            detail: None,
            moderated_at: Some(Utc::now()),
        }
    }

    pub fn from_error(err: &ModerationError) -> Self {
        ModerationVerdict {
            status: VerdictStatus::Error,
            confidence: 0.0,
            categories: BTreeMap::new(),
            detail: Some(err.to_string()),
            moderated_at: Some(Utc::now()),
        }
    }
}

/// What a classifier says about one piece of media.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub is_safe: bool,
    /// 0..=1
    pub confidence: f64,
    pub categories: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Error)]
pub enum ModerationError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
    #[error("media could not be processed: {0}")]
    Unprocessable(String),
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, kind: MediaKind, reference: &str) -> Result<Classification, ModerationError>;
}

/// Approves everything. Used when no real classifier is wired in.
pub struct PassthroughClassifier;

#[async_trait]
impl Classifier for PassthroughClassifier {
    async fn classify(&self, _kind: MediaKind, _reference: &str) -> Result<Classification, ModerationError> {
        Ok(Classification {
            is_safe: true,
            confidence: 0.0,
            categories: BTreeMap::new(),
        })
    }
}

#[derive(Debug, Clone)]
struct ModerationJob {
    message_id: MessageId,
    kind: MediaKind,
    reference: String,
    attempt: u32,
}

#[derive(Clone)]
pub struct ModerationQueue {
    tx: mpsc::Sender<ModerationJob>,
}

impl ModerationQueue {
    /// Spawns the worker and returns the handle used to submit jobs. The
    /// worker exits once every handle is dropped.
    pub fn start(
        classifier: Arc<dyn Classifier>,
        bridge: PersistenceBridge,
        config: &ModerationConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let worker = Worker {
            classifier,
            bridge,
            retry_tx: tx.downgrade(),
            max_attempts: config.max_attempts.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        };
        tokio::spawn(worker.run(rx));
        ModerationQueue { tx }
    }

    /// Queues every moderated attachment of a freshly stored message.
    pub fn submit(&self, message: &Message) {
        for attachment in message.media.iter().filter(|a| a.kind.is_moderated()) {
            let job = ModerationJob {
                message_id: message.id,
                kind: attachment.kind,
                reference: attachment.reference.clone(),
                attempt: 1,
            };
            if let Err(e) = self.tx.try_send(job) {
                warn!(
                    "Moderation queue rejected {} of message {}, leaving it pending: {}",
                    attachment.kind.as_str(),
                    message.id,
                    e
                );
            }
        }
    }
}

struct Worker {
    classifier: Arc<dyn Classifier>,
    bridge: PersistenceBridge,
    retry_tx: mpsc::WeakSender<ModerationJob>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<ModerationJob>) {
        while let Some(job) = rx.recv().await {
            self.process(job).await;
        }
        debug!("Moderation worker stopped");
    }

    async fn process(&self, job: ModerationJob) {
        let verdict = match self.classifier.classify(job.kind, &job.reference).await {
            Ok(classification) => ModerationVerdict::from_classification(classification),
            Err(e) => {
                error!(
                    "Classification of {} for message {} failed (attempt {}): {}",
                    job.kind.as_str(),
                    job.message_id,
                    job.attempt,
                    e
                );
                ModerationVerdict::from_error(&e)
            }
        };
        let status = verdict.status;

        if let Err(e) = self.bridge.record_verdict(job.message_id, job.kind, &verdict).await {
            error!("Failed to store verdict for message {}: {}", job.message_id, e);
        } else {
            info!(
                "Message {} {} moderated: {}",
                job.message_id,
                job.kind.as_str(),
                status.as_str()
            );
        }

        if status == VerdictStatus::Error && job.attempt < self.max_attempts {
            self.schedule_retry(job);
        }
    }

    fn schedule_retry(&self, mut job: ModerationJob) {
        let Some(tx) = self.retry_tx.upgrade() else {
            return;
        };
        job.attempt += 1;
        let delay = self.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tx.send(job).await {
                warn!("Dropping moderation retry: {}", e);
            }
        });
    }
}
