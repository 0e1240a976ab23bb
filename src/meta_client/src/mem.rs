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

//! An in-memory [MetaStore] with working watches, leases and mutexes,
//! for tests that drive membership churn without an etcd cluster.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex as AsyncMutex, OwnedMutexGuard};

use crate::{EventStream, LeaseId, MetaStore, Result, WatchEvent};

struct Inner {
    kvs: BTreeMap<String, (Vec<u8>, Option<LeaseId>)>,
}

pub struct MemStore {
    inner: Mutex<Inner>,
    events_tx: broadcast::Sender<WatchEvent>,
    mutexes: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    held: Mutex<HashMap<Vec<u8>, OwnedMutexGuard<()>>>,
    next_token: AtomicU64,
    next_lease: AtomicI64,
}

impl Default for MemStore {
    fn default() -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(Inner {
                kvs: BTreeMap::new(),
            }),
            events_tx,
            mutexes: AsyncMutex::new(HashMap::new()),
            held: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
            next_lease: AtomicI64::new(1),
        }
    }
}

impl MemStore {
    /// Drop every key attached to `lease`, emitting DELETE events, the way
    /// etcd evicts leased keys when their ttl runs out.
    pub fn expire_lease(&self, lease: LeaseId) {
        let expired: Vec<(String, Vec<u8>)> = {
            let mut inner = self.inner.lock().unwrap();
            let keys: Vec<String> = inner
                .kvs
                .iter()
                .filter(|(_, (_, l))| *l == Some(lease))
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| inner.kvs.remove(&k).map(|(v, _)| (k, v)))
                .collect()
        };
        for (key, prev) in expired {
            let _ = self.events_tx.send(WatchEvent::Delete {
                key,
                prev_value: Some(prev),
            });
        }
    }

    /// Number of keys currently stored, for assertions.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().kvs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetaStore for MemStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.kvs.get(key).map(|(v, _)| v.clone()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.kvs.insert(key.to_string(), (value.clone(), lease));
        }
        let _ = self.events_tx.send(WatchEvent::Put {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Option<Vec<u8>>> {
        let created = {
            let mut inner = self.inner.lock().unwrap();
            match inner.kvs.get(key) {
                Some((current, _)) => return Ok(Some(current.clone())),
                None => {
                    inner.kvs.insert(key.to_string(), (value.clone(), lease));
                    true
                }
            }
        };
        if created {
            let _ = self.events_tx.send(WatchEvent::Put {
                key: key.to_string(),
                value,
            });
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let prev = {
            let mut inner = self.inner.lock().unwrap();
            inner.kvs.remove(key).map(|(v, _)| v)
        };
        if let Some(prev) = prev {
            let _ = self.events_tx.send(WatchEvent::Delete {
                key: key.to_string(),
                prev_value: Some(prev),
            });
        }
        Ok(())
    }

    async fn grant_lease(&self, _ttl: Duration) -> Result<LeaseId> {
        Ok(self.next_lease.fetch_add(1, Ordering::Relaxed))
    }

    async fn keep_lease_alive(&self, _lease: LeaseId) -> Result<()> {
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str, with_prev_value: bool) -> Result<EventStream> {
        let mut rx = self.events_tx.subscribe();
        let prefix = prefix.to_string();
        let events = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if !event.key().starts_with(&prefix) {
                            continue;
                        }
                        let event = match event {
                            WatchEvent::Delete { key, .. } if !with_prev_value => {
                                WatchEvent::Delete {
                                    key,
                                    prev_value: None,
                                }
                            }
                            other => other,
                        };
                        yield Ok(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(Box::pin(events))
    }

    async fn lock(&self, name: &str, _lease_ttl: Duration) -> Result<Vec<u8>> {
        let mutex = {
            let mut mutexes = self.mutexes.lock().await;
            mutexes
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = mutex.lock_owned().await;
        let token = format!("{}/{}", name, self.next_token.fetch_add(1, Ordering::Relaxed));
        let token = token.into_bytes();
        self.held.lock().unwrap().insert(token.clone(), guard);
        Ok(token)
    }

    async fn unlock(&self, lock_key: Vec<u8>) -> Result<()> {
        self.held.lock().unwrap().remove(&lock_key);
        Ok(())
    }
}
