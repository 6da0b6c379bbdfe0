// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::Path;

use meshsig_net::{now_ms, Advertisement, CacheEntry, EntrySource, PeerId};
use tracing::debug;

use crate::error::{CliError, Result};
use crate::output::Output;

use super::{format_ms, open_cache};

const MAX_IMPORT_SIZE: u64 = 64 * 1024;

fn source_label(source: EntrySource) -> &'static str {
    match source {
        EntrySource::Overlay => "overlay",
        EntrySource::Restored => "restored",
        EntrySource::Manual => "manual",
    }
}

#[tracing::instrument(skip(out), fields(path = %path.display()))]
pub fn cmd_cache_list(out: &Output, path: &Path) -> Result<()> {
    let cache = open_cache(path)?;
    let entries = cache.get_all();
    if entries.is_empty() {
        out.info("Discovery cache is empty.");
        return Ok(());
    }

    out.signer_table_header();
    for entry in &entries {
        let ad = &entry.advertisement;
        let routes = ad.multiaddrs.len() + ad.relay_addrs.len() + usize::from(ad.webrtc_addr.is_some());
        out.signer_row(
            ad.peer_id.as_str(),
            &ad.public_key.to_hex(),
            routes,
            &format_ms(ad.expires_at),
        );
    }
    out.newline();
    out.info(&format!("{} signer(s)", entries.len()));
    Ok(())
}

#[tracing::instrument(skip(out), fields(path = %path.display()))]
pub fn cmd_cache_show(out: &Output, path: &Path, peer_id: &str) -> Result<()> {
    let cache = open_cache(path)?;
    let entry = cache
        .get(&PeerId::new(peer_id))
        .ok_or_else(|| CliError::Other(format!("No cached advertisement for {peer_id}")))?;
    print_entry(out, &entry);
    Ok(())
}

fn print_entry(out: &Output, entry: &CacheEntry) {
    let ad = &entry.advertisement;
    out.header(ad.peer_id.as_str());
    out.key_field("Public key", &ad.public_key.to_hex());
    out.field("Address", &ad.wallet_address);
    out.field("Source", source_label(entry.source));
    out.field("Cached", &format_ms(entry.inserted_at));
    out.field("Expires", &format_ms(ad.expires_at));
    for addr in &ad.multiaddrs {
        out.field("Dial", addr.as_str());
    }
    for addr in &ad.relay_addrs {
        out.field("Relay", addr.as_str());
    }
    if let Some(addr) = &ad.webrtc_addr {
        out.field("WebRTC", addr.as_str());
    }
    if !ad.capabilities.transaction_kinds.is_empty() {
        out.field("Kinds", &ad.capabilities.transaction_kinds.join(", "));
    }
    out.field("Fee", &ad.capabilities.fee.to_string());
}

#[tracing::instrument(skip(out), fields(path = %path.display()))]
pub fn cmd_cache_import(out: &Output, path: &Path, file: &Path) -> Result<()> {
    if std::fs::metadata(file)?.len() > MAX_IMPORT_SIZE {
        return Err(CliError::Other(format!("{} is too large", file.display())));
    }
    let json = std::fs::read_to_string(file)?;
    let advertisement = Advertisement::from_json(&json)
        .map_err(|e| CliError::Other(format!("Invalid advertisement: {e}")))?;
    advertisement.verify(now_ms())?;

    let cache = open_cache(path)?;
    let entry = cache.put(advertisement, EntrySource::Manual)?;
    cache.flush()?;
    debug!(peer_id = %entry.peer_id(), "imported advertisement");
    out.success(&format!("Imported {}", entry.peer_id()));
    Ok(())
}

#[tracing::instrument(skip(out), fields(path = %path.display()))]
pub fn cmd_cache_remove(out: &Output, path: &Path, peer_id: &str) -> Result<()> {
    let cache = open_cache(path)?;
    match cache.remove(&PeerId::new(peer_id))? {
        Some(_) => {
            cache.flush()?;
            out.success(&format!("Removed {peer_id}"));
        }
        None => out.warn(&format!("{peer_id} is not cached")),
    }
    Ok(())
}

#[tracing::instrument(skip(out), fields(path = %path.display()))]
pub fn cmd_cache_prune(out: &Output, path: &Path) -> Result<()> {
    let cache = open_cache(path)?;
    let pruned = cache.prune_expired(now_ms())?;
    cache.flush()?;
    out.success(&format!("Pruned {pruned} expired advertisement(s)"));
    Ok(())
}
