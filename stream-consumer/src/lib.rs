// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

pub mod config;
pub mod worker;

pub use config::StreamConsumerConfig;
pub use worker::Worker;
