// Copyright (C) 2024-2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of tidings.
//
// tidings is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// tidings is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with tidings.  If not,
// see <http://www.gnu.org/licenses/>.

//! # tidings
//!
//! A multi-tenant social activity backend. Organizations own members & applications; applications
//! own end users, the connections between them and the events they emit. Reads are served straight
//! from the [store]; mutations are packed onto an [ordered log] by the [dispatcher] and applied to
//! the store asynchronously by the [applier].
//!
//! [store]: crate::storage
//! [ordered log]: crate::ordered_log
//! [dispatcher]: crate::dispatcher
//! [applier]: crate::applier
pub mod applications;
pub mod applier;
pub mod connections;
pub mod dispatcher;
pub mod entities;
pub mod events;
pub mod feed;
pub mod flake;
pub mod graph;
pub mod http;
pub mod identity_cache;
pub mod last_read;
pub mod members;
pub mod memory;
pub mod metrics;
pub mod ordered_log;
pub mod organizations;
pub mod password;
pub mod pipeline;
pub mod postgres;
pub mod problems;
pub mod rate_limit;
pub mod storage;
pub mod tidings;
pub mod tokens;
pub mod users;
