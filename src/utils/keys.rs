use chrono::Utc;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use uuid::Uuid;

/// Characters escaped inside a single key segment. `/` is never part of a
/// segment, so the separator survives encoding.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}')
    .add(b'\\')
    .add(b'+');

/// File extension for a stored object, derived from its MIME type.
pub fn ext_from_mime(mime: &str) -> &'static str {
    let mime = mime
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        _ => "bin",
    }
}

/// Mint a `<prefix>YYYY/MM/DD/<uuid>.<ext>` object key.
pub fn date_prefixed_key(prefix: &str, mime: &str) -> String {
    let date = Utc::now().format("%Y/%m/%d");
    format!(
        "{}{}/{}.{}",
        prefix,
        date,
        Uuid::new_v4(),
        ext_from_mime(mime)
    )
}

/// Percent-encode a key per segment, preserving `/` separators.
pub fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| utf8_percent_encode(segment, SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Keys are rejected when they could escape the bucket namespace.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && !key.split('/').any(|segment| segment == "..")
}
