//! Parser for GnuPG `--with-colons` key listings.
//!
//! Field positions follow GnuPG's `doc/DETAILS`:
//!
//! | index | field |
//! |-------|-------|
//! | 0 | record type |
//! | 1 | validity |
//! | 2 | key length |
//! | 3 | public-key algorithm |
//! | 4 | key ID |
//! | 5 | creation date |
//! | 6 | expiration date |
//! | 9 | user ID |
//! | 11 | key capabilities |
//! | 16 | curve name |

use crate::error::{ChatPgpError, Result};
use crate::model::{Capabilities, KeyAlgorithm, KeyId, KeyInfo, KeyValidity, SubKeyInfo};
use crate::userid::{parse_user_id, unescape_colon_field};

const FIELD_VALIDITY: usize = 1;
const FIELD_KEY_LENGTH: usize = 2;
const FIELD_ALGORITHM: usize = 3;
const FIELD_KEY_ID: usize = 4;
const FIELD_CREATED: usize = 5;
const FIELD_EXPIRES: usize = 6;
const FIELD_USER_ID: usize = 9;
const FIELD_CAPABILITIES: usize = 11;
const FIELD_CURVE: usize = 16;

/// Converts a full colon listing into key records, in input order.
///
/// Fails on the first subkey or user-ID line that has no owning record, or on a
/// subkey whose secret/public marker disagrees with the open record.
pub fn parse_colon_listing(text: &str) -> Result<Vec<KeyInfo>> {
    let mut keys = Vec::new();
    let mut current: Option<KeyInfo> = None;

    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        let fields: Vec<&str> = line.split(':').collect();

        match fields[0] {
            kind @ ("sec" | "pub") => {
                if let Some(key) = current.take() {
                    keys.push(key);
                }
                let primary = parse_subkey_fields(&fields, line_no)?;
                let capability_field = field(&fields, FIELD_CAPABILITIES);
                current = Some(KeyInfo {
                    primary,
                    private: kind == "sec",
                    user_ids: Vec::new(),
                    primary_capabilities: Capabilities::from_primary_field(capability_field),
                    subkeys: Vec::new(),
                });
            }
            kind @ ("ssb" | "sub") => {
                let key = current.as_mut().ok_or_else(|| {
                    ChatPgpError::parse(format!("line {line_no}: {kind} record before any key"))
                })?;
                let secret_marker = kind == "ssb";
                if secret_marker != key.private {
                    return Err(ChatPgpError::parse(format!(
                        "line {line_no}: {kind} record inside a {} key",
                        if key.private { "secret" } else { "public" }
                    )));
                }
                key.subkeys.push(parse_subkey_fields(&fields, line_no)?);
            }
            "uid" => {
                let key = current.as_mut().ok_or_else(|| {
                    ChatPgpError::parse(format!("line {line_no}: uid record before any key"))
                })?;
                let raw = unescape_colon_field(field(&fields, FIELD_USER_ID));
                key.user_ids.push(parse_user_id(&raw));
            }
            _ => {}
        }
    }

    if let Some(key) = current {
        keys.push(key);
    }

    Ok(keys)
}

fn parse_subkey_fields(fields: &[&str], line_no: usize) -> Result<SubKeyInfo> {
    let key_id = KeyId::new(field(fields, FIELD_KEY_ID));
    if key_id.is_empty() {
        return Err(ChatPgpError::parse(format!("line {line_no}: missing key id")));
    }

    let algorithm: u8 = parse_number(fields, FIELD_ALGORITHM, line_no)?.unwrap_or(0);
    let key_length: u32 = parse_number(fields, FIELD_KEY_LENGTH, line_no)?.unwrap_or(0);
    let creation_date: u64 = parse_number(fields, FIELD_CREATED, line_no)?.unwrap_or(0);
    let expiration_date: Option<u64> = parse_number(fields, FIELD_EXPIRES, line_no)?;
    let curve = Some(field(fields, FIELD_CURVE))
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    Ok(SubKeyInfo {
        validity: KeyValidity::from_code(field(fields, FIELD_VALIDITY)),
        algorithm: KeyAlgorithm::from(algorithm),
        curve,
        key_length,
        key_id,
        creation_date,
        expiration_date,
        capabilities: Capabilities::from_key_field(field(fields, FIELD_CAPABILITIES)),
    })
}

fn field<'a>(fields: &[&'a str], index: usize) -> &'a str {
    fields.get(index).copied().unwrap_or("")
}

fn parse_number<T: std::str::FromStr>(
    fields: &[&str],
    index: usize,
    line_no: usize,
) -> Result<Option<T>> {
    let value = field(fields, index);
    if value.is_empty() {
        return Ok(None);
    }
    value.parse::<T>().map(Some).map_err(|_| {
        ChatPgpError::parse(format!(
            "line {line_no}: field {} is not a number: {value:?}",
            index + 1
        ))
    })
}
