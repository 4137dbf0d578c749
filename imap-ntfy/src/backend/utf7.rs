//! IMAP modified UTF-7 mailbox names (RFC 3501 section 5.1.3).

use base64::alphabet::IMAP_MUTF7;
use base64::engine::general_purpose::NO_PAD;
use base64::engine::GeneralPurpose;
use base64::Engine;
use std::borrow::Cow;

const ENGINE: GeneralPurpose = GeneralPurpose::new(&IMAP_MUTF7, NO_PAD);

/// Encode a UTF-8 mailbox name for use on the wire.
///
/// Printable ASCII passes through, `&` becomes `&-` and every other run of characters is
/// written as `&` + base64 of the UTF-16 big endian units + `-`.
pub fn encode(name: &str) -> Cow<'_, str> {
    if name.bytes().all(|b| is_direct(b.into()) && b != b'&') {
        return Cow::Borrowed(name);
    }

    let mut out = String::with_capacity(name.len() * 2);
    let mut pending: Vec<u8> = Vec::new();

    for ch in name.chars() {
        if is_direct(ch) {
            flush(&mut pending, &mut out);
            if ch == '&' {
                out.push_str("&-");
            } else {
                out.push(ch);
            }
            continue;
        }

        let mut units = [0u16; 2];
        for unit in ch.encode_utf16(&mut units) {
            pending.extend_from_slice(&unit.to_be_bytes());
        }
    }
    flush(&mut pending, &mut out);

    Cow::Owned(out)
}

fn is_direct(ch: char) -> bool {
    (' '..='~').contains(&ch)
}

fn flush(pending: &mut Vec<u8>, out: &mut String) {
    if pending.is_empty() {
        return;
    }
    out.push('&');
    ENGINE.encode_string(pending.as_slice(), out);
    out.push('-');
    pending.clear();
}
