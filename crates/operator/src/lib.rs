/*
 * HonseFarm Operator - Kubernetes operator for HonseFarm clusters
 * Copyright (C) 2025 The HonseFarm Authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! HonseFarm operator core library
//!
//! Renders the desired state of a `HonseFarmCluster` (configuration bundle,
//! generated secrets, workloads, tunnel, build job) and converges a
//! Kubernetes namespace towards it.

pub mod crds;
pub mod tasks;

// Re-export commonly used types
pub use crds::{ClusterPhase, HonseFarmCluster, HonseFarmClusterSpec, HonseFarmClusterStatus};
pub use tasks::config::OperatorConfig;
pub use tasks::{Error, Result};
