// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

pub mod client_stream;
pub mod reentrant;
pub mod validators;
