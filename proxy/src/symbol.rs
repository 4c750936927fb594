//! Symbol request parsing and response formatting
//!
//! Requests carry `+`-separated addresses, in the POST body or the raw query
//! string. The response lists every address that resolved.

use std::fmt::Write;

/// Parse an unsigned integer in the base its prefix names: `0x`, `0o`, `0b`,
/// a bare leading `0` for octal, decimal otherwise. Surrounding whitespace is
/// not accepted.
pub fn parse_address(token: &str) -> Option<u64> {
    let (digits, radix) = if let Some(hex) = strip_base(token, 'x') {
        (hex, 16)
    } else if let Some(oct) = strip_base(token, 'o') {
        (oct, 8)
    } else if let Some(bin) = strip_base(token, 'b') {
        (bin, 2)
    } else if token.len() > 1 && token.starts_with('0') {
        (&token[1..], 8)
    } else {
        (token, 10)
    };

    // from_str_radix tolerates a leading '+'.
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}

fn strip_base(token: &str, base: char) -> Option<&str> {
    let rest = token.strip_prefix('0')?;
    rest.strip_prefix(base)
        .or_else(|| rest.strip_prefix(base.to_ascii_uppercase()))
}

/// Addresses in request order. Zero and malformed tokens are dropped; the last
/// token needs no trailing `+`.
pub fn parse_addresses(input: &[u8]) -> Vec<u64> {
    input
        .split(|&b| b == b'+')
        .filter_map(|token| std::str::from_utf8(token).ok())
        .filter_map(parse_address)
        .filter(|&addr| addr != 0)
        .collect()
}

/// Symbol table text. The count header is always `1`: it only says that
/// symbol information is available.
#[derive(Debug)]
pub struct SymbolTable {
    text: String,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            text: String::from("num_symbols: 1\n"),
        }
    }

    pub fn push(&mut self, addr: u64, name: &str) {
        let _ = writeln!(self.text, "{:#x} {}", addr, name);
    }

    pub fn push_read_error(&mut self, err: impl std::fmt::Display) {
        let _ = writeln!(self.text, "reading request: {}", err);
    }

    pub fn into_string(self) -> String {
        self.text
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}
