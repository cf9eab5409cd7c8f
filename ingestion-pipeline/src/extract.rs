use anyhow::{anyhow, Context};
use common::error::AppError;
use dom_smoothie::{Readability, TextMode};
use tracing::debug;

/// Resolve the effective media type: the declared content type wins, an
/// extension guess from the storage ref covers uploads without one.
pub fn resolve_content_type(declared: &str, storage_ref: &str) -> mime::Mime {
    if let Ok(parsed) = declared.parse::<mime::Mime>() {
        return parsed;
    }
    mime_guess::from_path(storage_ref).first_or(mime::APPLICATION_OCTET_STREAM)
}

/// Content-type-aware text extraction. Anything that cannot be turned into
/// text is an extraction error and fails the document with a cause.
pub fn extract_text(bytes: &[u8], content_type: &mime::Mime) -> Result<String, AppError> {
    match (content_type.type_(), content_type.subtype()) {
        (mime::TEXT, mime::HTML) => extract_html(bytes),
        (mime::TEXT, _) => decode_utf8(bytes),
        (mime::APPLICATION, mime::JSON) => decode_utf8(bytes),
        (mime::APPLICATION, mime::PDF) => extract_pdf(bytes),
        (kind, subtype) => Err(AppError::Extraction(anyhow!(
            "unsupported content type {kind}/{subtype}"
        ))),
    }
}

fn decode_utf8(bytes: &[u8]) -> Result<String, AppError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .context("document is not valid UTF-8")
        .map_err(AppError::Extraction)
}

fn extract_html(bytes: &[u8]) -> Result<String, AppError> {
    let html = decode_utf8(bytes)?;

    let config = dom_smoothie::Config {
        text_mode: TextMode::Markdown,
        ..Default::default()
    };
    let mut readability = Readability::new(html, None, Some(config))
        .context("readability setup failed")
        .map_err(AppError::Extraction)?;
    let article = readability
        .parse()
        .context("readability parse failed")
        .map_err(AppError::Extraction)?;

    debug!(
        title = %article.title,
        chars = article.text_content.len(),
        "extracted readable text from html"
    );

    Ok(article.text_content.to_string())
}

fn extract_pdf(bytes: &[u8]) -> Result<String, AppError> {
    pdf_extract::extract_text_from_mem(bytes)
        .map(|text| text.trim().to_string())
        .context("pdf extraction failed")
        .map_err(AppError::Extraction)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_passthrough() {
        let mime = resolve_content_type("text/plain", "doc.txt");
        let text = extract_text(b"plain body", &mime).expect("extract");
        assert_eq!(text, "plain body");
    }

    #[test]
    fn test_markdown_is_text() {
        let mime = resolve_content_type("text/markdown", "notes.md");
        let text = extract_text(b"# Title\n\nBody", &mime).expect("extract");
        assert!(text.contains("Body"));
    }

    #[test]
    fn test_invalid_utf8_is_extraction_error() {
        let mime = resolve_content_type("text/plain", "doc.txt");
        let result = extract_text(&[0xff, 0xfe, 0x00], &mime);
        assert!(matches!(result, Err(AppError::Extraction(_))));
    }

    #[test]
    fn test_unsupported_type_is_extraction_error() {
        let mime = resolve_content_type("image/png", "logo.png");
        let result = extract_text(b"\x89PNG", &mime);
        let err = result.expect_err("unsupported type must fail");
        assert!(err.to_string().contains("unsupported content type"));
    }

    #[test]
    fn test_html_extraction_strips_markup() {
        let mime = resolve_content_type("text/html", "page.html");
        let html = br#"<html><head><title>T</title></head>
            <body><article><h1>Heading</h1>
            <p>The actual readable body of the page, long enough to keep.</p>
            </article></body></html>"#;
        let text = extract_text(html, &mime).expect("extract");
        assert!(text.contains("actual readable body"));
        assert!(!text.contains("<p>"));
    }

    #[test]
    fn test_content_type_guessed_from_extension() {
        let mime = resolve_content_type("", "report.md");
        assert_eq!(mime.type_(), mime::TEXT);
    }
}
