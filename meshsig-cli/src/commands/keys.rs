// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::io::Write;
use std::path::Path;

use meshsig_net::{
    derive_address, AdvertisementBuilder, EntrySource, PeerId, SignerCapabilities, SignerKeys,
};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{CliError, Result};
use crate::output::Output;

use super::{format_ms, load_keys, open_cache};

#[tracing::instrument(skip(out))]
pub fn cmd_keygen(out: &Output, output: Option<&Path>) -> Result<()> {
    let keys = SignerKeys::generate();
    let public_key = keys.public_key();
    let secret = hex::encode(*keys.secret_bytes());

    out.header("Signing key");
    out.field("Public key", &public_key.to_hex());
    out.field("Address", &derive_address(&public_key));

    match output {
        Some(path) => {
            write_secret(path, &secret)?;
            info!(path = %path.display(), "wrote signing key");
            out.success(&format!("Secret key written to {}", path.display()));
        }
        None => {
            out.key_field("Secret key", &secret);
            out.secret_warning();
        }
    }
    Ok(())
}

fn write_secret(path: &Path, secret: &str) -> Result<()> {
    if path.exists() {
        return Err(CliError::Other(format!(
            "{} already exists; refusing to overwrite a key",
            path.display()
        )));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(secret.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
#[tracing::instrument(skip(out, cfg, kinds))]
pub fn cmd_advertise(
    out: &Output,
    cfg: &Config,
    cache_path: &Path,
    key: &Path,
    peer_id: &str,
    kinds: Vec<String>,
    fee: u64,
    import: bool,
) -> Result<()> {
    let keys = load_keys(key)?;
    let node = cfg.node();
    let advertisement = AdvertisementBuilder::new(PeerId::new(peer_id))
        .multiaddrs(node.multiaddrs)
        .relay_addrs(node.relay_addrs)
        .webrtc_addr(node.webrtc_addr)
        .capabilities(SignerCapabilities::new(kinds, fee))
        .ttl(node.advertisement_ttl)
        .sign(&keys)?;
    debug!(id = %advertisement.id, "signed advertisement");

    let json = advertisement
        .to_json()
        .map_err(|e| CliError::Other(format!("Failed to encode advertisement: {e}")))?;
    println!("{json}");

    out.field("Peer", advertisement.peer_id.as_str());
    out.field("Expires", &format_ms(advertisement.expires_at));
    if import {
        let cache = open_cache(cache_path)?;
        cache.put(advertisement, EntrySource::Manual)?;
        cache.flush()?;
        out.success("Stored in discovery cache");
    }
    Ok(())
}
