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

//! A multi-threaded runtime that supports running futures.

use std::future::Future;

use macros::define_result;
use snafu::{ResultExt, Snafu};

pub use tokio::task::JoinHandle;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum Error {
    #[snafu(display("Failed to build runtime, err:{}", source))]
    BuildRuntime { source: std::io::Error },
}

define_result!(Error);

/// A runtime to run future tasks.
pub struct Runtime {
    rt: tokio::runtime::Runtime,
}

impl Runtime {
    /// Spawn a future and run it in the background, returning its handle.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.rt.spawn(future)
    }

    /// Run a future to completion on this runtime, blocking the caller.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.rt.block_on(future)
    }
}

/// Runtime builder with named worker threads.
pub struct Builder {
    thread_name: String,
    builder: tokio::runtime::Builder,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            thread_name: "runtime-worker".to_string(),
            builder: tokio::runtime::Builder::new_multi_thread(),
        }
    }
}

impl Builder {
    /// Sets the number of worker threads the runtime will use.
    pub fn worker_threads(&mut self, val: usize) -> &mut Self {
        self.builder.worker_threads(val);
        self
    }

    /// Sets the stack size of worker threads.
    pub fn stack_size(&mut self, val: usize) -> &mut Self {
        self.builder.thread_stack_size(val);
        self
    }

    /// Sets name of threads spawned by the runtime.
    pub fn thread_name(&mut self, val: impl Into<String>) -> &mut Self {
        self.thread_name = val.into();
        self
    }

    pub fn enable_all(&mut self) -> &mut Self {
        self.builder.enable_all();
        self
    }

    pub fn build(&mut self) -> Result<Runtime> {
        let rt = self
            .builder
            .thread_name(self.thread_name.clone())
            .build()
            .context(BuildRuntime)?;

        Ok(Runtime { rt })
    }
}
