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

//! [MetaStore] backed by an etcd cluster.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use etcd_client::{
    Certificate, Compare, CompareOp, ConnectOptions, EventType, GetOptions, Identity, LockOptions,
    PutOptions, TlsOptions, Txn, TxnOp, TxnOpResponse, WatchOptions,
};
use logger::warn;
use snafu::ResultExt;
use tokio::{fs, io};

use crate::{
    config::EtcdConfig, Error, EventStream, LeaseId, MetaStore, Result, StoreFailure, WatchClosed,
    WatchEvent,
};

pub struct EtcdStore {
    client: etcd_client::Client,
    retry_num: usize,
    retry_interval: Duration,
}

impl EtcdStore {
    pub async fn connect(config: &EtcdConfig) -> Result<Self> {
        let connect_options = build_connect_options(config).await.map_err(|e| {
            Error::StoreFailure {
                msg: "failed to load etcd tls material".to_string(),
                source: Box::new(e),
            }
        })?;
        let client = etcd_client::Client::connect(&config.server_addrs, Some(connect_options))
            .await
            .context(StoreFailure {
                msg: "failed to connect to etcd",
            })?;

        Ok(Self {
            client,
            retry_num: config.retry_num,
            retry_interval: config.retry_interval.0,
        })
    }

    /// Run one rpc with bounded retries. Every attempt works on a fresh
    /// clone of the client so a poisoned channel does not stick.
    async fn with_retry<T, F, Fut>(&self, msg: &'static str, op: F) -> Result<T>
    where
        F: Fn(etcd_client::Client) -> Fut,
        Fut: Future<Output = std::result::Result<T, etcd_client::Error>>,
    {
        let mut attempt = 0;
        loop {
            match op(self.client.clone()).await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.retry_num => {
                    attempt += 1;
                    warn!(
                        "Meta store rpc failed, will retry, msg:{}, attempt:{}, err:{}",
                        msg, attempt, e
                    );
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(e) => return Err(e).context(StoreFailure { msg }),
            }
        }
    }
}

#[async_trait]
impl MetaStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        let resp = self
            .with_retry("get", move |mut client| {
                let key = key.clone();
                async move { client.get(key, None).await }
            })
            .await?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let prefix = prefix.to_string();
        let resp = self
            .with_retry("get_prefix", move |mut client| {
                let prefix = prefix.clone();
                async move {
                    client
                        .get(prefix, Some(GetOptions::new().with_prefix()))
                        .await
                }
            })
            .await?;

        let mut kvs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            if let Ok(key) = kv.key_str() {
                kvs.push((key.to_string(), kv.value().to_vec()));
            }
        }
        Ok(kvs)
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()> {
        let key = key.to_string();
        self.with_retry("put", move |mut client| {
            let key = key.clone();
            let value = value.clone();
            let options = lease.map(|id| PutOptions::new().with_lease(id));
            async move { client.put(key, value, options).await }
        })
        .await?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        let resp = self
            .with_retry("put_if_absent", move |mut client| {
                let key = key.clone();
                let value = value.clone();
                let options = lease.map(|id| PutOptions::new().with_lease(id));
                async move {
                    let txn = Txn::new()
                        .when(vec![Compare::create_revision(
                            key.clone(),
                            CompareOp::Equal,
                            0,
                        )])
                        .and_then(vec![TxnOp::put(key.clone(), value, options)])
                        .or_else(vec![TxnOp::get(key, None)]);
                    client.txn(txn).await
                }
            })
            .await?;

        if resp.succeeded() {
            return Ok(None);
        }
        for op_resp in resp.op_responses() {
            if let TxnOpResponse::Get(get_resp) = op_resp {
                if let Some(kv) = get_resp.kvs().first() {
                    return Ok(Some(kv.value().to_vec()));
                }
            }
        }
        // The key existed at compare time but vanished before the read:
        // report a transient failure and let the caller re-drive.
        Err(Error::StoreFailure {
            msg: "put_if_absent raced with a delete".to_string(),
            source: "inconsistent txn response".into(),
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_retry("delete", move |mut client| {
            let key = key.clone();
            async move { client.delete(key, None).await }
        })
        .await?;
        Ok(())
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let ttl_secs = ttl.as_secs().max(1) as i64;
        let resp = self
            .with_retry("grant_lease", move |mut client| async move {
                client.lease_grant(ttl_secs, None).await
            })
            .await?;
        Ok(resp.id())
    }

    async fn keep_lease_alive(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        let (mut keeper, mut responses) = client
            .lease_keep_alive(lease)
            .await
            .context(StoreFailure {
                msg: "open lease keep alive",
            })?;
        keeper.keep_alive().await.context(StoreFailure {
            msg: "send lease keep alive",
        })?;
        responses.message().await.context(StoreFailure {
            msg: "confirm lease keep alive",
        })?;
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str, with_prev_value: bool) -> Result<EventStream> {
        let mut options = WatchOptions::new().with_prefix();
        if with_prev_value {
            options = options.with_prev_key();
        }
        let mut client = self.client.clone();
        let (watcher, mut stream) = client
            .watch(prefix, Some(options))
            .await
            .context(StoreFailure { msg: "open watch" })?;

        let events = async_stream::stream! {
            // Keep the watch session alive as long as the stream is polled.
            let _watcher = watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        for event in resp.events() {
                            let kv = match event.kv() {
                                Some(kv) => kv,
                                None => continue,
                            };
                            let key = match kv.key_str() {
                                Ok(key) => key.to_string(),
                                Err(_) => continue,
                            };
                            match event.event_type() {
                                EventType::Put => {
                                    yield Ok(WatchEvent::Put {
                                        key,
                                        value: kv.value().to_vec(),
                                    });
                                }
                                EventType::Delete => {
                                    let prev_value =
                                        event.prev_kv().map(|kv| kv.value().to_vec());
                                    yield Ok(WatchEvent::Delete { key, prev_value });
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        yield Err(WatchClosed {}.build());
                        break;
                    }
                    Err(e) => {
                        yield Err(Error::StoreFailure {
                            msg: "watch stream".to_string(),
                            source: Box::new(e),
                        });
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(events))
    }

    async fn lock(&self, name: &str, lease_ttl: Duration) -> Result<Vec<u8>> {
        let lease = self.grant_lease(lease_ttl).await?;
        let mut client = self.client.clone();
        let resp = client
            .lock(name, Some(LockOptions::new().with_lease(lease)))
            .await
            .context(StoreFailure { msg: "lock" })?;
        Ok(resp.key().to_vec())
    }

    async fn unlock(&self, lock_key: Vec<u8>) -> Result<()> {
        let mut client = self.client.clone();
        client
            .unlock(lock_key)
            .await
            .context(StoreFailure { msg: "unlock" })?;
        Ok(())
    }
}

/// Build the connect options for accessing the etcd cluster.
async fn build_connect_options(config: &EtcdConfig) -> io::Result<ConnectOptions> {
    let connect_options = ConnectOptions::default()
        .with_connect_timeout(config.dial_timeout.0)
        .with_timeout(config.rw_timeout.0);

    let tls = &config.tls;
    if tls.enable {
        let server_ca_cert = fs::read(&tls.ca_cert_path).await?;
        let client_cert = fs::read(&tls.client_cert_path).await?;
        let client_key = fs::read(&tls.client_key_path).await?;

        let ca_cert = Certificate::from_pem(server_ca_cert);
        let client_ident = Identity::from_pem(client_cert, client_key);
        let mut tls_options = TlsOptions::new()
            .ca_certificate(ca_cert)
            .identity(client_ident);

        if let Some(domain) = &tls.domain {
            tls_options = tls_options.domain_name(domain);
        }

        Ok(connect_options.with_tls(tls_options))
    } else {
        Ok(connect_options)
    }
}
