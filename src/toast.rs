//! Toast notifications shown by the UI

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MAX_PENDING: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToastLevel {
    Success,
    Error,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Toast {
    pub id: String,
    pub level: ToastLevel,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Shared queue; the UI drains it after each action.
#[derive(Clone, Default)]
pub struct Toaster {
    queue: Arc<Mutex<VecDeque<Toast>>>,
}

impl Toaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, level: ToastLevel, title: impl Into<String>, message: impl Into<String>) {
        let toast = Toast {
            id: Uuid::new_v4().to_string(),
            level,
            title: title.into(),
            message: message.into(),
            created_at: Utc::now(),
        };
        match level {
            ToastLevel::Error => log::warn!("[toast] {}: {}", toast.title, toast.message),
            _ => log::debug!("[toast] {}: {}", toast.title, toast.message),
        }
        if let Ok(mut queue) = self.queue.lock() {
            // oldest toasts are dropped if nobody drains
            if queue.len() >= MAX_PENDING {
                queue.pop_front();
            }
            queue.push_back(toast);
        }
    }

    pub fn success(&self, title: impl Into<String>, message: impl Into<String>) {
        self.push(ToastLevel::Success, title, message);
    }

    pub fn error(&self, title: impl Into<String>, message: impl Into<String>) {
        self.push(ToastLevel::Error, title, message);
    }

    pub fn info(&self, title: impl Into<String>, message: impl Into<String>) {
        self.push(ToastLevel::Info, title, message);
    }

    pub fn drain(&self) -> Vec<Toast> {
        self.queue
            .lock()
            .map(|mut q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending error toasts, without draining.
    pub fn errors(&self) -> Vec<Toast> {
        self.queue
            .lock()
            .map(|q| q.iter().filter(|t| t.level == ToastLevel::Error).cloned().collect())
            .unwrap_or_default()
    }
}
