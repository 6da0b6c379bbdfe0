// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::Path;

use crate::config::Config;
use crate::error::Result;
use crate::output::Output;

fn addrs(list: &[meshsig_net::Multiaddr]) -> String {
    if list.is_empty() {
        return "(none)".into();
    }
    list.iter().map(|a| a.as_str()).collect::<Vec<_>>().join(", ")
}

pub fn cmd_config_show(out: &Output, cfg: &Config, cache_path: &Path) -> Result<()> {
    let node = cfg.node();
    out.header("Configuration");
    out.field("Cache", &cache_path.display().to_string());
    out.field("Log level", &cfg.log_level.to_string());
    out.field("Dialable", &addrs(&node.multiaddrs));
    out.field("Relays", &addrs(&node.relay_addrs));
    out.field(
        "WebRTC",
        node.webrtc_addr.as_ref().map_or("(none)", |a| a.as_str()),
    );
    out.field("Advertisement TTL", &format!("{}s", node.advertisement_ttl.as_secs()));
    out.field("Step timeout", &format!("{}s", node.connectivity.step_timeout.as_secs()));
    out.field(
        "Retry",
        &format!(
            "{} attempt(s), base delay {}ms",
            node.retry.max_attempts,
            node.retry.base_delay.as_millis()
        ),
    );
    out.field("Session TTL", &format!("{}s", node.session.session_ttl.as_secs()));
    out.field(
        "Quorum",
        &if node.quorum.allow_partial_connectivity {
            format!("lenient, min {} connected", node.quorum.min_connected_participants)
        } else {
            "strict".into()
        },
    );
    Ok(())
}

pub fn cmd_config_path(out: &Output, explicit: Option<&Path>) -> Result<()> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => Config::default_path()?,
    };
    out.info(&path.display().to_string());
    if !path.exists() {
        out.warn("File does not exist; defaults are in effect");
    }
    Ok(())
}
