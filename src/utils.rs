//! Utility functions

/// Image file extensions the permanent store recognizes, in search order.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

/// Sanitize a gallery title for use as a directory name component.
///
/// Replaces path separators and other file-system-hostile characters with
/// `_`, collapses surrounding whitespace, and caps the length.
pub fn sanitize_dir_name(name: &str) -> String {
    const MAX_LEN: usize = 96;

    let mut out: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    out = out.trim().trim_matches('.').to_string();
    if out.len() > MAX_LEN {
        // Truncate on a char boundary
        let mut end = MAX_LEN;
        while !out.is_char_boundary(end) {
            end -= 1;
        }
        out.truncate(end);
    }
    out
}

/// Guess a file extension from image magic bytes. Returns `None` when the
/// bytes do not look like a supported image format.
pub fn sniff_extension(bytes: &[u8]) -> Option<&'static str> {
    match image::guess_format(bytes).ok()? {
        image::ImageFormat::Jpeg => Some("jpg"),
        image::ImageFormat::Png => Some("png"),
        image::ImageFormat::Gif => Some("gif"),
        image::ImageFormat::WebP => Some("webp"),
        _ => None,
    }
}

/// Pick a file extension from a `Content-Type` header value.
pub fn extension_from_content_type(content_type: &str) -> Option<&'static str> {
    let essence = content_type.split(';').next()?.trim();
    match essence {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

/// Whether a body chunk looks like text (a suspected HTML block page)
/// rather than binary image data.
pub fn looks_like_text(bytes: &[u8]) -> bool {
    let trimmed: &[u8] = {
        let mut s = bytes;
        while let [first, rest @ ..] = s {
            if first.is_ascii_whitespace() {
                s = rest;
            } else {
                break;
            }
        }
        s
    };
    match trimmed.first() {
        Some(b'<') | Some(b'{') => true,
        Some(_) => trimmed
            .iter()
            .take(64)
            .all(|b| b.is_ascii_graphic() || b.is_ascii_whitespace()),
        None => false,
    }
}
