//! Request/reply bodies exchanged with a peer data server
//!
//! Requests name a single task (`task_id`) or a batch (`tasks`), optionally
//! narrowed to a dotted `data_path` inside the task's result. Replies wrap
//! each item as `{"data": ...}` or `{"error": {"code", "message"}}`; batch
//! replies are `{"items": [...], "errors": bool}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{DataError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_path: Option<String>,
}

impl DataQuery {
    pub fn single(task_id: impl Into<String>, data_path: Option<&str>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            tasks: None,
            data_path: data_path.map(String::from),
        }
    }

    #[must_use]
    pub fn batch(tasks: Vec<String>, data_path: Option<&str>) -> Self {
        Self {
            task_id: None,
            tasks: Some(tasks),
            data_path: data_path.map(String::from),
        }
    }

    #[must_use]
    pub fn is_batch(&self) -> bool {
        self.task_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    /// Task result is not held by this server
    NotAvailable,
    /// Task result exists but the requested path does not
    NoSuchDataPath,
    Unknown,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotAvailable => "notAvailable",
            Self::NoSuchDataPath => "noSuchDataPath",
            Self::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemReply {
    Data(Value),
    Error(ErrorBody),
}

impl ItemReply {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorBody {
            code,
            message: message.into(),
        })
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// The data, or the server error as [`DataError::Server`]
    pub fn into_data(self) -> Result<Value> {
        match self {
            Self::Data(value) => Ok(value),
            Self::Error(ErrorBody { code, message }) => Err(DataError::Server { code, message }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataReply {
    Batch { items: Vec<ItemReply>, errors: bool },
    Item(ItemReply),
}

impl DataReply {
    #[must_use]
    pub fn batch(items: Vec<ItemReply>) -> Self {
        let errors = items.iter().any(ItemReply::is_error);
        Self::Batch { items, errors }
    }

    /// Data of a single-task reply
    pub fn into_data(self) -> Result<Value> {
        match self {
            Self::Item(item) => item.into_data(),
            Self::Batch { .. } => Err(DataError::UnexpectedReply(
                "batch reply to a single task request".to_string(),
            )),
        }
    }

    /// Items of a batch reply
    pub fn into_items(self) -> Result<Vec<ItemReply>> {
        match self {
            Self::Batch { items, .. } => Ok(items),
            Self::Item(ItemReply::Error(ErrorBody { code, message })) => {
                Err(DataError::Server { code, message })
            }
            Self::Item(ItemReply::Data(_)) => Err(DataError::UnexpectedReply(
                "single reply to a batch request".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_shape() {
        let query = DataQuery::single("t1", Some("a.b"));
        assert_eq!(
            serde_json::to_value(&query).unwrap(),
            json!({ "task_id": "t1", "data_path": "a.b" })
        );
        assert!(!query.is_batch());
        assert!(DataQuery::batch(vec!["t1".to_string()], None).is_batch());
    }

    #[test]
    fn test_reply_shapes() {
        let item = DataReply::Item(ItemReply::error(ErrorCode::NotAvailable, "gone"));
        assert_eq!(
            serde_json::to_value(&item).unwrap(),
            json!({ "error": { "code": "notAvailable", "message": "gone" } })
        );

        let batch = DataReply::batch(vec![
            ItemReply::Data(json!(1)),
            ItemReply::error(ErrorCode::NoSuchDataPath, "x"),
        ]);
        let value = serde_json::to_value(&batch).unwrap();
        assert_eq!(value["errors"], json!(true));
        assert_eq!(value["items"][0], json!({ "data": 1 }));
    }

    #[test]
    fn test_data_that_looks_like_a_batch_stays_an_item() {
        let reply = DataReply::Item(ItemReply::Data(json!({ "items": [], "errors": false })));
        let parsed: DataReply = serde_json::from_value(serde_json::to_value(&reply).unwrap()).unwrap();
        assert_eq!(parsed, reply);
    }

    #[test]
    fn test_into_data_maps_server_error() {
        let reply = DataReply::Item(ItemReply::error(ErrorCode::NoSuchDataPath, "a.b does not exist"));
        assert!(matches!(
            reply.into_data(),
            Err(DataError::Server { code: ErrorCode::NoSuchDataPath, .. })
        ));
    }
}
