//! User-ID text grammar.
//!
//! ```text
//! user-id = [name] [ "(" comment ")" ] "<" email ">"
//!         | local "@" domain
//!         | name
//! ```
//!
//! The scanner works right to left over the bracketed forms and never backtracks,
//! so its cost is linear in the input length.

use crate::model::UserId;

pub fn parse_user_id(raw: &str) -> UserId {
    let text = raw.trim();

    if let Some(parsed) = parse_bracketed(text) {
        return parsed;
    }

    if is_bare_email(text) {
        return UserId {
            name: None,
            email: text.to_string(),
        };
    }

    UserId {
        name: non_empty(text),
        email: String::new(),
    }
}

fn parse_bracketed(text: &str) -> Option<UserId> {
    let inner = text.strip_suffix('>')?;
    let open = inner.rfind('<')?;
    let email = inner[open + 1..].trim();
    if email.is_empty() || email.contains('<') {
        return None;
    }

    let mut rest = inner[..open].trim_end();
    if let Some(without_close) = rest.strip_suffix(')') {
        if let Some(paren) = without_close.rfind('(') {
            rest = without_close[..paren].trim_end();
        }
    }

    Some(UserId {
        name: non_empty(rest.trim()),
        email: email.to_string(),
    })
}

fn is_bare_email(text: &str) -> bool {
    let mut parts = text.splitn(2, '@');
    let (Some(local), Some(domain)) = (parts.next(), parts.next()) else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && !domain.contains('@')
        && !text.chars().any(|c| c.is_whitespace() || c == '<' || c == '>')
}

fn non_empty(text: &str) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Decodes the `\xHH` escapes GnuPG writes into colon-list text fields.
///
/// Malformed escapes are kept verbatim.
pub fn unescape_colon_field(field: &str) -> String {
    if !field.contains("\\x") {
        return field.to_string();
    }

    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() && bytes[i + 1] == b'x' {
            let decoded = std::str::from_utf8(&bytes[i + 2..i + 4])
                .ok()
                .filter(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Renders a user ID as `Name <email>` for terminal output.
pub fn display_user_id(uid: &UserId) -> String {
    let text = match (&uid.name, uid.email.is_empty()) {
        (Some(name), false) => format!("{name} <{}>", uid.email),
        (Some(name), true) => name.clone(),
        (None, _) => format!("<{}>", uid.email),
    };
    sanitize_for_terminal(&text)
}

/// Escapes control characters in untrusted text before it reaches a terminal.
///
/// User IDs come from whoever made the key and may carry ANSI escape sequences.
pub fn sanitize_for_terminal(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\n' | '\r' | '\t' => out.push(' '),
            c if c.is_control() => {
                let code = c as u32;
                if code <= 0xFF {
                    out.push_str(&format!("\\x{code:02X}"));
                } else {
                    out.push_str(&format!("\\u{{{code:X}}}"));
                }
            }
            c => out.push(c),
        }
    }
    out
}
