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

//! Request/response connections to a shard backend.
//!
//! [Connection] is the seam the pool and the tests plug into; the default
//! implementation frames serde-encoded messages with a length prefix over
//! tcp.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use snafu::ResultExt;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time,
};

use crate::{
    protocol::{Request, Response},
    Codec, Result, Timeout, Unreachable,
};

/// Limit on a single framed message, to fail fast on corrupt length words.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[async_trait]
pub trait Connection: Send {
    async fn call(&mut self, request: &Request) -> Result<Response>;
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn dial(&self, addr: &str) -> Result<Box<dyn Connection>>;
}

pub type ConnectionFactoryRef = Arc<dyn ConnectionFactory>;

pub struct TcpConnection {
    addr: String,
    stream: TcpStream,
    rw_timeout: Duration,
}

impl TcpConnection {
    async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let len = payload.len() as u32;
        self.stream
            .write_all(&len.to_be_bytes())
            .await
            .context(Unreachable {
                addr: self.addr.clone(),
            })?;
        self.stream
            .write_all(payload)
            .await
            .context(Unreachable {
                addr: self.addr.clone(),
            })?;
        self.stream.flush().await.context(Unreachable {
            addr: self.addr.clone(),
        })?;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.stream
            .read_exact(&mut len_buf)
            .await
            .context(Unreachable {
                addr: self.addr.clone(),
            })?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            return Codec {
                msg: format!("frame of {len} bytes exceeds limit"),
            }
            .fail();
        }
        let mut payload = vec![0u8; len as usize];
        self.stream
            .read_exact(&mut payload)
            .await
            .context(Unreachable {
                addr: self.addr.clone(),
            })?;
        Ok(payload)
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn call(&mut self, request: &Request) -> Result<Response> {
        let payload = serde_json::to_vec(request).map_err(|e| {
            Codec {
                msg: format!("encode request: {e}"),
            }
            .build()
        })?;

        let rw_timeout = self.rw_timeout;
        let exchange = async {
            self.write_frame(&payload).await?;
            self.read_frame().await
        };
        let raw = time::timeout(rw_timeout, exchange)
            .await
            .map_err(|_| {
                Timeout {
                    addr: self.addr.clone(),
                    op: "call",
                }
                .build()
            })??;

        serde_json::from_slice(&raw).map_err(|e| {
            Codec {
                msg: format!("decode response: {e}"),
            }
            .build()
        })
    }
}

pub struct TcpConnectionFactory {
    dial_timeout: Duration,
    rw_timeout: Duration,
}

impl TcpConnectionFactory {
    pub fn new(dial_timeout: Duration, rw_timeout: Duration) -> Self {
        Self {
            dial_timeout,
            rw_timeout,
        }
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn dial(&self, addr: &str) -> Result<Box<dyn Connection>> {
        let stream = time::timeout(self.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Timeout {
                    addr: addr.to_string(),
                    op: "dial",
                }
                .build()
            })?
            .context(Unreachable {
                addr: addr.to_string(),
            })?;
        stream.set_nodelay(true).context(Unreachable {
            addr: addr.to_string(),
        })?;

        Ok(Box::new(TcpConnection {
            addr: addr.to_string(),
            stream,
            rw_timeout: self.rw_timeout,
        }))
    }
}
