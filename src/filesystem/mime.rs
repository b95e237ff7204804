use super::path_utils::extension_of;

const OCTET_STREAM: &str = "application/octet-stream";

/// Content type for serving a stored file.
///
/// The extension decides; `head` (the first bytes of the file) is only
/// sniffed when the extension is unknown.
pub fn content_type_for(filename: &str, head: &[u8]) -> String {
    let guessed = guess_from_extension(filename);
    if guessed != OCTET_STREAM {
        return guessed.to_string();
    }
    if let Some(kind) = infer::get(head) {
        return kind.mime_type().to_string();
    }
    if is_probably_text(head) && !head.is_empty() {
        return "text/plain".to_string();
    }
    OCTET_STREAM.to_string()
}

pub fn guess_from_extension(filename: &str) -> &'static str {
    match extension_of(filename).as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        // browsers play all of these through the mp4 pipeline
        "mp4" | "mkv" | "webm" | "mov" | "avi" => "video/mp4",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        _ => OCTET_STREAM,
    }
}

/// Whether thumbnails for this file come from a video frame
pub fn is_video(filename: &str) -> bool {
    guess_from_extension(filename).starts_with("video/")
}

/// Whether the first bytes of a file look like text. `buffer` may end in
/// the middle of a multi-byte character.
pub fn is_probably_text(buffer: &[u8]) -> bool {
    if buffer.is_empty() {
        return true;
    }

    // NUL is a strong binary signal.
    if buffer.contains(&0) {
        return false;
    }

    if let Err(e) = std::str::from_utf8(buffer) {
        if e.error_len().is_some() {
            return false;
        }
    }

    let control_count = buffer
        .iter()
        .filter(|&&b| b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r'))
        .count();

    // at most one control byte in ten
    control_count * 10 <= buffer.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_wins_over_content() {
        assert_eq!(content_type_for("clip.MKV", b"plain words"), "video/mp4");
        assert_eq!(content_type_for("a.jpeg", &[]), "image/jpeg");
    }

    #[test]
    fn test_unknown_extension_is_sniffed() {
        let png_magic = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];
        assert_eq!(content_type_for("blob", &png_magic), "image/png");
        assert_eq!(content_type_for("notes", b"hello there\n"), "text/plain");
        assert_eq!(content_type_for("data.xyz", &[0, 1, 2, 3]), OCTET_STREAM);
    }

    #[test]
    fn test_is_video() {
        assert!(is_video("holiday.webm"));
        assert!(!is_video("holiday.jpg"));
    }
}
