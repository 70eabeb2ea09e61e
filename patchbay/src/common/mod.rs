// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

pub mod bridge;
pub mod daemon;
pub mod protocol;
pub mod session;
pub mod worker;
