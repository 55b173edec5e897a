//! Per-item outcomes reported by the result-streaming mode.

use std::fmt;

use serde::Serialize;
use tokio::task::JoinError;

use crate::error::panic_message;

/// Why an item did not succeed.
#[derive(Debug)]
pub enum ItemFailure<E> {
    /// The action returned an error.
    Action(E),
    /// The action panicked; holds the panic message.
    Panicked(String),
    /// The item was never run to completion because the run was cancelled.
    Cancelled,
}

impl<E> ItemFailure<E> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Action(_) => "action",
            Self::Panicked(_) => "panicked",
            Self::Cancelled => "cancelled",
        }
    }

    pub(crate) fn from_join_error(err: JoinError) -> Self {
        if err.is_panic() {
            let payload = err.into_panic();
            Self::Panicked(panic_message(payload.as_ref()))
        } else {
            Self::Cancelled
        }
    }
}

impl<E: fmt::Display> fmt::Display for ItemFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Action(e) => write!(f, "{e}"),
            Self::Panicked(msg) => write!(f, "action panicked: {msg}"),
            Self::Cancelled => f.write_str("cancelled before completion"),
        }
    }
}

/// An input item paired with how its action ended.
#[derive(Debug)]
pub struct ItemResult<T, E> {
    item: T,
    failure: Option<ItemFailure<E>>,
}

impl<T, E> ItemResult<T, E> {
    pub fn succeeded_with(item: T) -> Self {
        Self {
            item,
            failure: None,
        }
    }

    pub fn failed_with(item: T, failure: ItemFailure<E>) -> Self {
        Self {
            item,
            failure: Some(failure),
        }
    }

    pub fn item(&self) -> &T {
        &self.item
    }

    pub fn into_item(self) -> T {
        self.item
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn error(&self) -> Option<&ItemFailure<E>> {
        self.failure.as_ref()
    }

    pub fn into_parts(self) -> (T, Option<ItemFailure<E>>) {
        (self.item, self.failure)
    }

    pub fn into_result(self) -> Result<T, (T, ItemFailure<E>)> {
        match self.failure {
            None => Ok(self.item),
            Some(failure) => Err((self.item, failure)),
        }
    }

    pub fn to_json(&self) -> serde_json::Value
    where
        T: Serialize,
        E: fmt::Display,
    {
        let mut response = serde_json::json!({
            "item": self.item,
            "succeeded": self.succeeded(),
        });

        if let Some(ref failure) = self.failure {
            response["error"] = serde_json::json!({
                "kind": failure.kind(),
                "message": failure.to_string(),
            });
        }

        response
    }
}
