// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use console::{style, StyledObject, Term};

const PEER_WIDTH: usize = 24;
const KEY_PREFIX: usize = 16;
const ROUTES_WIDTH: usize = 7;

/// Human-facing output. Everything goes to stderr so stdout stays free for
/// machine-readable payloads such as a signed advertisement.
pub struct Output {
    term: Term,
}

impl Output {
    pub fn new() -> Self {
        Self {
            term: Term::stderr(),
        }
    }

    fn line(&self, text: &str) {
        let _ = self.term.write_line(text);
    }

    fn marked(&self, mark: StyledObject<&str>, msg: &str) {
        self.line(&format!("{mark} {msg}"));
    }

    pub fn success(&self, msg: &str) {
        self.marked(style("✓").green().bold(), msg);
    }

    pub fn error(&self, msg: &str) {
        self.marked(style("✗").red().bold(), msg);
    }

    pub fn warn(&self, msg: &str) {
        self.marked(style("!").yellow().bold(), msg);
    }

    pub fn info(&self, msg: &str) {
        self.line(msg);
    }

    pub fn header(&self, msg: &str) {
        self.line(&format!("\n{}", style(msg).bold()));
    }

    pub fn field(&self, label: &str, value: &str) {
        self.line(&format!("  {}: {value}", style(label).dim()));
    }

    /// A field holding key material or a signature.
    pub fn key_field(&self, label: &str, value: &str) {
        self.line(&format!("  {}: {}", style(label).dim(), style(value).yellow()));
    }

    pub fn newline(&self) {
        self.line("");
    }

    pub fn signer_table_header(&self) {
        self.line(&format!(
            "\n{:<PEER_WIDTH$} {:<KEY_PREFIX$} {:>ROUTES_WIDTH$}  {}",
            style("PEER").bold(),
            style("PUBLIC KEY").bold(),
            style("ROUTES").bold(),
            style("EXPIRES").bold(),
        ));
    }

    /// One cached signer; the public key is shortened to its first
    /// characters.
    pub fn signer_row(&self, peer_id: &str, public_key_hex: &str, routes: usize, expires: &str) {
        let key = &public_key_hex[..KEY_PREFIX.min(public_key_hex.len())];
        self.line(&format!(
            "{peer_id:<PEER_WIDTH$} {:<KEY_PREFIX$} {routes:>ROUTES_WIDTH$}  {expires}",
            style(key).yellow(),
        ));
    }

    pub fn secret_warning(&self) {
        self.line(&format!(
            "\n{}",
            style("Keep this key offline. Anyone holding it can sign as you.")
                .red()
                .bold()
        ));
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::new()
    }
}
