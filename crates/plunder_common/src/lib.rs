// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of plunder

pub mod models;
pub mod proto;
pub mod runtime;
