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

//! A fixed-size connection pool for one backend address.

use std::sync::{Arc, Mutex};

use logger::debug;
use tokio::sync::Semaphore;

use crate::{
    conn::{Connection, ConnectionFactoryRef},
    protocol::{Request, Response},
    PoolClosed, Result,
};

/// At most `capacity` connections exist at a time; callers block on
/// acquisition when all of them are in flight. Connections are dialed
/// lazily and dropped on any rpc error, so the next caller re-dials.
pub struct ConnPool {
    addr: String,
    factory: ConnectionFactoryRef,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn Connection>>>,
}

impl ConnPool {
    pub fn new(addr: String, factory: ConnectionFactoryRef, capacity: usize) -> Self {
        Self {
            addr,
            factory,
            permits: Arc::new(Semaphore::new(capacity.max(1))),
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn call(&self, request: &Request) -> Result<Response> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PoolClosed { addr: self.addr.clone() }.build())?;

        let idle = self.idle.lock().unwrap().pop();
        let mut conn = match idle {
            Some(conn) => conn,
            None => self.factory.dial(&self.addr).await?,
        };

        match conn.call(request).await {
            Ok(response) => {
                self.idle.lock().unwrap().push(conn);
                Ok(response)
            }
            // The connection may be out of sync with its peer, discard it.
            Err(e) => {
                debug!("Discarding connection after rpc failure, addr:{}", self.addr);
                Err(e)
            }
        }
    }
}
