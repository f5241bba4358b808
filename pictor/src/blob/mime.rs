//! MIME identification from leading bytes.

/// Identifies a MIME type from the first bytes of a payload.
///
/// Image formats are resolved through `image::guess_format`, which only
/// inspects magic bytes. A couple of non-raster formats that commonly pass
/// through the pipeline are matched by hand.
pub(crate) fn detect(buf: &[u8]) -> Option<&'static str> {
    if buf.is_empty() {
        return None;
    }
    if let Ok(format) = image::guess_format(buf) {
        return Some(format.to_mime_type());
    }
    if buf.starts_with(b"%PDF") {
        return Some("application/pdf");
    }
    let head = &buf[..buf.len().min(256)];
    if head.starts_with(b"<svg") || contains(head, b"<svg") {
        return Some("image/svg+xml");
    }
    None
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_png() {
        let png = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0];
        assert_eq!(detect(&png), Some("image/png"));
    }

    #[test]
    fn test_detect_jpeg() {
        let jpeg = [0xff, 0xd8, 0xff, 0xe0, 0, 0];
        assert_eq!(detect(&jpeg), Some("image/jpeg"));
    }

    #[test]
    fn test_detect_webp() {
        let mut webp = Vec::new();
        webp.extend_from_slice(b"RIFF");
        webp.extend_from_slice(&[0x20, 0, 0, 0]);
        webp.extend_from_slice(b"WEBPVP8 ");
        assert_eq!(detect(&webp), Some("image/webp"));
    }

    #[test]
    fn test_detect_pdf() {
        assert_eq!(detect(b"%PDF-1.7 ..."), Some("application/pdf"));
    }

    #[test]
    fn test_detect_svg() {
        assert_eq!(
            detect(b"<?xml version=\"1.0\"?><svg xmlns=\"\">"),
            Some("image/svg+xml")
        );
    }

    #[test]
    fn test_detect_unknown() {
        assert_eq!(detect(b"hello world"), None);
        assert_eq!(detect(b""), None);
    }
}
