// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Connection-pooled client of a single shard backend.
//!
//! Requests go to the shard master; the caller resolves which address that
//! is. The client never retries across master changes, re-resolution is
//! the fan-out's business on its next request.

use std::sync::Arc;

use async_trait::async_trait;
use common_types::sample::Series;
use dashmap::DashMap;
use macros::define_result;
use snafu::{Backtrace, Snafu};

use crate::{
    config::ShardClientConfig,
    conn::{ConnectionFactoryRef, TcpConnectionFactory},
    pool::ConnPool,
    protocol::{
        AddRequest, GeneralResponse, LabelValuesRequest, Request, Response, SelectRequest,
        SlaveOfCommand,
    },
};

pub mod config;
pub mod conn;
pub mod pool;
pub mod protocol;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum Error {
    #[snafu(display("Shard is unreachable, addr:{}, err:{}", addr, source))]
    Unreachable {
        addr: String,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Shard rpc timed out, addr:{}, op:{}", addr, op))]
    Timeout {
        addr: String,
        op: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Shard replied with failure, addr:{}, msg:{}", addr, msg))]
    ShardFailed {
        addr: String,
        msg: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Unexpected response kind from shard, addr:{}", addr))]
    UnexpectedResponse { addr: String, backtrace: Backtrace },

    #[snafu(display("Failed to encode or decode message, msg:{}", msg))]
    Codec { msg: String, backtrace: Backtrace },

    #[snafu(display("Connection pool is closed, addr:{}", addr))]
    PoolClosed { addr: String, backtrace: Backtrace },
}

define_result!(Error);

/// Read/write surface of one shard.
#[async_trait]
pub trait ShardClient: Send + Sync {
    async fn select(&self, request: SelectRequest) -> Result<Vec<Series>>;

    async fn label_values(&self, request: LabelValuesRequest) -> Result<Vec<String>>;

    async fn add(&self, request: AddRequest) -> Result<()>;
}

pub type ShardClientRef = Arc<dyn ShardClient>;

/// Hands out per-address shard clients. The fan-out layers depend on this
/// seam so tests can substitute scripted shards.
pub trait ShardClientProvider: Send + Sync {
    fn client_for(&self, addr: &str) -> ShardClientRef;
}

pub type ShardClientProviderRef = Arc<dyn ShardClientProvider>;

/// Sends the promotion command used by failover. Kept separate from
/// [ShardClient] since it dials the target directly instead of going
/// through a master's pool.
#[async_trait]
pub trait SlaveOfSender: Send + Sync {
    async fn slave_of(&self, addr: &str, master_addr: &str) -> Result<()>;
}

pub type SlaveOfSenderRef = Arc<dyn SlaveOfSender>;

struct PooledShardClient {
    pool: ConnPool,
}

impl PooledShardClient {
    fn interpret_general(addr: &str, response: GeneralResponse) -> Result<()> {
        if response.status.is_succeed() {
            Ok(())
        } else {
            ShardFailed {
                addr: addr.to_string(),
                msg: response.message,
            }
            .fail()
        }
    }
}

#[async_trait]
impl ShardClient for PooledShardClient {
    async fn select(&self, request: SelectRequest) -> Result<Vec<Series>> {
        match self.pool.call(&Request::Select(request)).await? {
            Response::Select(response) => {
                if response.status.is_succeed() {
                    Ok(response.series)
                } else {
                    ShardFailed {
                        addr: self.pool.addr().to_string(),
                        msg: response.error_msg,
                    }
                    .fail()
                }
            }
            _ => UnexpectedResponse {
                addr: self.pool.addr().to_string(),
            }
            .fail(),
        }
    }

    async fn label_values(&self, request: LabelValuesRequest) -> Result<Vec<String>> {
        match self.pool.call(&Request::LabelValues(request)).await? {
            Response::LabelValues(response) => {
                if response.status.is_succeed() {
                    Ok(response.values)
                } else {
                    ShardFailed {
                        addr: self.pool.addr().to_string(),
                        msg: response.error_msg,
                    }
                    .fail()
                }
            }
            _ => UnexpectedResponse {
                addr: self.pool.addr().to_string(),
            }
            .fail(),
        }
    }

    async fn add(&self, request: AddRequest) -> Result<()> {
        match self.pool.call(&Request::Add(request)).await? {
            Response::General(response) => {
                Self::interpret_general(self.pool.addr(), response)
            }
            _ => UnexpectedResponse {
                addr: self.pool.addr().to_string(),
            }
            .fail(),
        }
    }
}

/// Builds and caches one pooled client per backend address.
pub struct ShardClientFactory {
    config: ShardClientConfig,
    conn_factory: ConnectionFactoryRef,
    clients: DashMap<String, ShardClientRef>,
}

impl ShardClientFactory {
    pub fn new(config: ShardClientConfig) -> Self {
        let conn_factory = Arc::new(TcpConnectionFactory::new(
            config.dial_timeout.0,
            config.rw_timeout.0,
        ));
        Self::with_conn_factory(config, conn_factory)
    }

    pub fn with_conn_factory(config: ShardClientConfig, conn_factory: ConnectionFactoryRef) -> Self {
        Self {
            config,
            conn_factory,
            clients: DashMap::new(),
        }
    }
}

impl ShardClientProvider for ShardClientFactory {
    fn client_for(&self, addr: &str) -> ShardClientRef {
        self.clients
            .entry(addr.to_string())
            .or_insert_with(|| {
                Arc::new(PooledShardClient {
                    pool: ConnPool::new(
                        addr.to_string(),
                        self.conn_factory.clone(),
                        self.config.conn_num_per_backend,
                    ),
                })
            })
            .value()
            .clone()
    }
}

#[async_trait]
impl SlaveOfSender for ShardClientFactory {
    async fn slave_of(&self, addr: &str, master_addr: &str) -> Result<()> {
        let mut conn = self.conn_factory.dial(addr).await?;
        let request = Request::SlaveOf(SlaveOfCommand {
            master_addr: master_addr.to_string(),
        });
        match conn.call(&request).await? {
            Response::General(response) => PooledShardClient::interpret_general(addr, response),
            _ => UnexpectedResponse {
                addr: addr.to_string(),
            }
            .fail(),
        }
    }
}
