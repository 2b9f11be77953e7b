//! MIME type guessing for imported media.
//!
//! The extension is trusted first (it is what the file will be served as),
//! falling back to sniffing magic bytes when the extension is unknown.

pub(crate) fn guess(extension: &str, head: &[u8]) -> Option<String> {
    let known = match extension.trim_start_matches('.') {
        "jpg" | "jpeg" | "jfif" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "svg" => "image/svg+xml",
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "ogg" | "oga" => "audio/ogg",
        "opus" => "audio/opus",
        "wav" => "audio/wav",
        "m4a" => "audio/mp4",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => return infer::get(head).map(|kind| kind.mime_type().to_string()),
    };
    Some(known.to_string())
}
