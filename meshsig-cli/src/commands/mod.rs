// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

pub mod cache;
pub mod config;
pub mod keys;
pub mod simulate;

use std::path::Path;

use chrono::{DateTime, Utc};
use meshsig_net::{DiscoveryCache, SignerKeys};
use tracing::debug;

use crate::error::{CliError, Result};

const MAX_KEY_FILE_SIZE: u64 = 1024;

pub(crate) fn load_keys(path: &Path) -> Result<SignerKeys> {
    let metadata = std::fs::metadata(path)?;
    if metadata.len() > MAX_KEY_FILE_SIZE {
        return Err(CliError::Other(format!(
            "{} is not a key file",
            path.display()
        )));
    }
    debug!(path = %path.display(), "reading key file");
    let secret = std::fs::read_to_string(path)?;
    Ok(SignerKeys::from_secret_hex(&secret)?)
}

pub(crate) fn open_cache(path: &Path) -> Result<DiscoveryCache> {
    debug!(path = %path.display(), "opening discovery cache");
    Ok(DiscoveryCache::open_path(path)?)
}

pub(crate) fn format_ms(ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}
