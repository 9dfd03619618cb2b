// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The Reader (component D): point and range reads from a stream and from
//! the global "all" order, with optional link resolution.

pub mod reader;

pub use reader::{AllSlice, ReadEventResult, Reader, StreamSlice};
