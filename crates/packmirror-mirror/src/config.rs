// PackMirror - Mirror Git Repositories to Object Storage
// Copyright (C) 2025 PackMirror Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.

//! Mirror run configuration

use std::time::Duration;

/// Tunables for a mirror run
///
/// The defaults are sized for mirroring ordinary repositories over a decent
/// link; the CLI exposes flags for each field.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Number of concurrent object workers (default: 10)
    pub object_workers: usize,

    /// Number of concurrent large-file workers (default: 10)
    pub lfs_workers: usize,

    /// Capacity of the pending large-file queue; enqueues block when full
    /// (default: 10 000)
    pub lfs_queue_capacity: usize,

    /// How often the keep-alive smoother forces a pull from the source HTTP
    /// body while the parser is busy (default: 1s)
    pub keepalive_interval: Duration,

    /// Overall timeout for one chunk to cross the smoother hand-off
    /// (default: 60s)
    pub chunk_timeout: Duration,

    /// How long a delta worker waits for its base object to become ready
    /// before giving up on the delta (default: 60s)
    pub base_wait_timeout: Duration,

    /// Attempts for the refs-advertisement fetch (default: 3)
    pub http_retries: u32,

    /// Optional custom S3 endpoint for S3-compatible destinations
    pub s3_endpoint: Option<String>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        MirrorConfig {
            object_workers: 10,
            lfs_workers: 10,
            lfs_queue_capacity: 10_000,
            keepalive_interval: Duration::from_secs(1),
            chunk_timeout: Duration::from_secs(60),
            base_wait_timeout: Duration::from_secs(60),
            http_retries: 3,
            s3_endpoint: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = MirrorConfig::default();
        assert_eq!(config.object_workers, 10);
        assert_eq!(config.lfs_workers, 10);
        assert_eq!(config.lfs_queue_capacity, 10_000);
        assert_eq!(config.keepalive_interval, Duration::from_secs(1));
        assert_eq!(config.chunk_timeout, Duration::from_secs(60));
        assert_eq!(config.http_retries, 3);
        assert!(config.s3_endpoint.is_none());
    }
}
