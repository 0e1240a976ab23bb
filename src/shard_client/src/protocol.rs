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

//! The typed request/response surface spoken with a shard.
//!
//! How messages are framed on the wire is the connection layer's business;
//! this module only fixes their shape and status codes.

use std::fmt;

use common_types::{matcher::Matcher, sample::Series};
use serde::{
    de::{self, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};

/// Shard response status. On the wire this is the bare code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Succeed,
    Failed,
}

impl Status {
    pub fn code(&self) -> u8 {
        match self {
            Status::Succeed => 0,
            Status::Failed => 1,
        }
    }

    pub fn is_succeed(&self) -> bool {
        matches!(self, Status::Succeed)
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Status, D::Error> {
        struct CodeVisitor;

        impl Visitor<'_> for CodeVisitor {
            type Value = Status;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a status code")
            }

            fn visit_u64<E: de::Error>(self, code: u64) -> Result<Status, E> {
                match code {
                    0 => Ok(Status::Succeed),
                    1 => Ok(Status::Failed),
                    other => Err(E::custom(format!("unknown status code: {other}"))),
                }
            }
        }

        deserializer.deserialize_u64(CodeVisitor)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SelectRequest {
    pub mint: i64,
    pub maxt: i64,
    /// Step hint in milliseconds, zero when absent.
    pub interval: i64,
    pub matchers: Vec<Matcher>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SelectResponse {
    pub status: Status,
    pub series: Vec<Series>,
    pub error_msg: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct LabelValuesRequest {
    pub name: String,
    pub matchers: Vec<Matcher>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct LabelValuesResponse {
    pub status: Status,
    pub values: Vec<String>,
    pub error_msg: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct AddRequest {
    pub series: Vec<Series>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct GeneralResponse {
    pub status: Status,
    pub message: String,
}

/// `master_addr == ""` means "slave of no one", i.e. become master.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SlaveOfCommand {
    pub master_addr: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub enum Request {
    Select(SelectRequest),
    LabelValues(LabelValuesRequest),
    Add(AddRequest),
    SlaveOf(SlaveOfCommand),
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub enum Response {
    Select(SelectResponse),
    LabelValues(LabelValuesResponse),
    General(GeneralResponse),
}
