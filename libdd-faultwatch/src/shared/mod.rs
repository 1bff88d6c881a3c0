// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Types shared between the public API and the in-process collector.

pub(crate) mod configuration;
pub mod constants;
pub mod fixed_buf;
pub(crate) mod rank;
