// Copyright 2023 Xayn AG
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Code shared across the silo crates.
//!
//! This are mostly leaf new types like `TenantId` and `QuotedIdentifier`,
//! but also very specific utility functions like the per-schema advisory
//! lock helpers and the retry policy used for connection probing.

pub mod postgres;
pub mod retry;
pub mod serde;
pub mod tenant;
