//! Request client for peer data servers
//!
//! Two timeouts bound a request: a short ping timeout on connection
//! establishment, failing fast with [`DataError::Unreachable`], and a longer
//! request timeout on the reply, failing with [`DataError::RequestTimeout`].

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use pipestream_core::config::DataServerConfig;
use pipestream_core::encoding::encoding_for;
use pipestream_core::{Encoding, JsonEncoding};

use crate::error::{DataError, Result};
use crate::protocol::{DataQuery, DataReply, ItemReply};
use crate::server::codec;

/// One request to one peer
pub struct DataRequest {
    address: String,
    query: DataQuery,
    encoding: Arc<dyn Encoding>,
    ping_timeout: Duration,
    request_timeout: Duration,
}

impl DataRequest {
    /// Request the result of one task, optionally narrowed to `data_path`
    pub fn single(address: impl Into<String>, task_id: impl Into<String>, data_path: Option<&str>) -> Self {
        Self::new(address, DataQuery::single(task_id, data_path))
    }

    /// Request the results of several tasks at once
    pub fn batch(address: impl Into<String>, tasks: Vec<String>, data_path: Option<&str>) -> Self {
        Self::new(address, DataQuery::batch(tasks, data_path))
    }

    fn new(address: impl Into<String>, query: DataQuery) -> Self {
        let defaults = DataServerConfig::default();
        Self {
            address: address.into(),
            query,
            encoding: Arc::new(JsonEncoding),
            ping_timeout: defaults.ping_timeout(),
            request_timeout: defaults.request_timeout(),
        }
    }

    /// Take encoding and timeouts from the data server configuration
    pub fn with_config(mut self, config: &DataServerConfig) -> Result<Self> {
        self.encoding = encoding_for(&config.encoding)?;
        self.ping_timeout = config.ping_timeout();
        self.request_timeout = config.request_timeout();
        Ok(self)
    }

    #[must_use]
    pub const fn with_timeouts(mut self, ping_timeout: Duration, request_timeout: Duration) -> Self {
        self.ping_timeout = ping_timeout;
        self.request_timeout = request_timeout;
        self
    }

    #[must_use]
    pub fn query(&self) -> &DataQuery {
        &self.query
    }

    /// Send the request and wait for the reply
    pub async fn invoke(&self) -> Result<DataReply> {
        let stream = match tokio::time::timeout(
            self.ping_timeout,
            TcpStream::connect(self.address.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(DataError::Unreachable {
                    address: self.address.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(DataError::Unreachable {
                    address: self.address.clone(),
                    reason: format!("no connection within {:?}", self.ping_timeout),
                })
            }
        };

        let mut conn = Framed::new(stream, codec());
        let body = self.encoding.encode(&serde_json::to_value(&self.query)?)?;
        conn.send(body).await?;
        debug!(address = %self.address, batch = self.query.is_batch(), "Data request sent");

        let reply = tokio::time::timeout(self.request_timeout, conn.next())
            .await
            .map_err(|_| DataError::RequestTimeout {
                address: self.address.clone(),
                timeout: self.request_timeout,
            })?
            .ok_or_else(|| {
                DataError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before reply",
                ))
            })??;

        let value = self.encoding.decode(&reply)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Data of a single-task request; server errors become [`DataError::Server`]
    pub async fn fetch(&self) -> Result<Value> {
        self.invoke().await?.into_data()
    }

    /// Items of a batch request
    pub async fn fetch_items(&self) -> Result<Vec<ItemReply>> {
        self.invoke().await?.into_items()
    }
}
