//! Output file naming

use mediafetch_types::Descriptor;
use std::path::{Path, PathBuf};
use url::Url;

const MAX_NAME_LEN: usize = 200;

/// Replace characters that are invalid in file names on common platforms
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        return "download".to_string();
    }

    trimmed.chars().take(MAX_NAME_LEN).collect()
}

/// Split a suggested name into stem and extension
fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            (stem, Some(ext))
        }
        _ => (name, None),
    }
}

/// Render the naming template for a descriptor.
///
/// `{name}` is the suggested name without its extension, `{id}` the
/// descriptor id and `{host}` the host of the source URL. The extension is
/// taken from the suggested name, then `format`, then `default_extension`.
pub fn file_name(
    descriptor: &Descriptor,
    template: &str,
    format: Option<&str>,
    default_extension: &str,
) -> String {
    let (stem, ext) = split_name(&descriptor.suggested_name);
    let host = Url::parse(&descriptor.source_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();

    let rendered = template
        .replace("{name}", stem)
        .replace("{id}", &descriptor.id)
        .replace("{host}", &host);

    let ext = ext
        .or(format)
        .unwrap_or(default_extension)
        .trim_start_matches('.');

    sanitize_filename(&format!("{}.{}", rendered, ext))
}

/// Full output path under `dir`
pub fn output_path(
    dir: &Path,
    descriptor: &Descriptor,
    template: &str,
    format: Option<&str>,
    default_extension: &str,
) -> PathBuf {
    dir.join(file_name(descriptor, template, format, default_extension))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> Descriptor {
        Descriptor {
            id: "abc123".into(),
            source_url: "https://video.test/watch?v=1".into(),
            download_url: "https://cdn.test/1".into(),
            suggested_name: name.into(),
            size_hint: None,
            checksum: None,
            headers: Default::default(),
        }
    }

    #[test]
    fn invalid_characters_are_replaced() {
        assert_eq!(sanitize_filename("a/b\\c:d*e?f\"g<h>i|j"), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize_filename("  ..  "), "download");
        assert_eq!(sanitize_filename("line\nbreak"), "line_break");
    }

    #[test]
    fn template_uses_suggested_extension_before_format() {
        let d = descriptor("My: Clip.webm");
        assert_eq!(file_name(&d, "{name}_{id}", Some("mp4"), "bin"), "My_ Clip_abc123.webm");
        assert_eq!(file_name(&d, "{host}-{id}", None, "bin"), "video.test-abc123.webm");
    }

    #[test]
    fn extension_falls_back_to_format_then_default() {
        let d = descriptor("stream");
        assert_eq!(file_name(&d, "{name}", Some(".mkv"), "mp4"), "stream.mkv");
        assert_eq!(file_name(&d, "{name}", None, "mp4"), "stream.mp4");
        assert_eq!(
            output_path(Path::new("/data"), &d, "{id}", None, "mp4"),
            PathBuf::from("/data/abc123.mp4")
        );
    }
}
