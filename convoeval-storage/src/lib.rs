// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Convoeval Storage
//!
//! Durable record of datasets, evaluation runs and per-case results.
//!
//! All state lives in concurrent in-memory maps so dashboard reads never wait
//! on writers. When opened on a directory, every mutation is also appended to
//! a CRC-framed log that is replayed on the next open.
//!
//! ```rust,ignore
//! use convoeval_storage::EvalStore;
//!
//! let store = EvalStore::open("./convoeval-data")?;
//! let dataset = store.create_dataset(dataset)?;
//! ```

pub mod eval_store;
mod log;

pub use eval_store::{EvalStore, RunStats, StoreError};
