//! Canonical library path layout.
//!
//! Pure functions from track metadata to filesystem paths: segment
//! sanitization, the album/track template, and deterministic collision
//! disambiguation. No I/O happens here.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::models::TrackMetadata;

/// Maximum length of a single path segment, in characters.
const MAX_SEGMENT_LEN: usize = 100;

/// Characters that are not allowed in path segments on common filesystems.
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Sanitize one path segment: replaces filesystem-illegal characters,
/// collapses whitespace and trims overlong names at a word boundary.
pub fn sanitize_segment(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if INVALID_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    let mut collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() > MAX_SEGMENT_LEN {
        let truncated: String = collapsed.chars().take(MAX_SEGMENT_LEN).collect();
        // Break at the last word boundary inside the limit
        collapsed = match truncated.rsplit_once(' ') {
            Some((head, _)) => head.to_string(),
            None => truncated,
        };
    }

    let trimmed = collapsed.trim_matches(|c: char| c == ' ' || c == '.').to_string();
    if trimmed.is_empty() {
        "Unknown".to_string()
    } else {
        trimmed
    }
}

/// File name for a track within its album directory.
///
/// Single-disc albums use `{NN} - {title}`; multi-disc albums use
/// `D{disc}T{NN} - {title}` so that lexical order within the directory
/// equals disc-then-track order.
pub fn track_file_name(meta: &TrackMetadata, extension: &str) -> String {
    let title = sanitize_segment(&meta.title);
    if meta.total_discs > 1 {
        format!(
            "D{}T{:02} - {}.{}",
            meta.disc_number, meta.track_number, title, extension
        )
    } else {
        format!("{:02} - {}.{}", meta.track_number, title, extension)
    }
}

/// Compute the canonical path for a track under the library root:
/// `{album_artist}/{album}/{track file name}`.
pub fn canonical_path(root: &Path, meta: &TrackMetadata, extension: &str) -> PathBuf {
    root.join(sanitize_segment(meta.album_artist_or_artist()))
        .join(sanitize_segment(&meta.album))
        .join(track_file_name(meta, extension))
}

/// Stable disambiguation suffix derived from (artist, album).
pub fn collision_suffix(artist: &str, album: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(artist.as_bytes());
    hasher.update([0x1f]);
    hasher.update(album.as_bytes());
    let digest = hasher.finalize();
    digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Append the collision suffix to a path's file stem:
/// `01 - Title.mp3` becomes `01 - Title [a1b2c3d4].mp3`.
pub fn disambiguate(path: &Path, artist: &str, album: &str) -> PathBuf {
    let suffix = collision_suffix(artist, album);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Unknown");
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{} [{}].{}", stem, suffix, ext),
        None => format!("{} [{}]", stem, suffix),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(title: &str, artist: &str, album: &str) -> TrackMetadata {
        TrackMetadata {
            source_id: "src".to_string(),
            title: title.to_string(),
            artist: artist.to_string(),
            album: album.to_string(),
            album_artist: None,
            track_number: 1,
            disc_number: 1,
            total_discs: 1,
            duration_secs: 180,
        }
    }

    #[test]
    fn sanitize_replaces_illegal_characters() {
        assert_eq!(sanitize_segment("AC/DC"), "AC_DC");
        assert_eq!(sanitize_segment("what?"), "what_");
        assert_eq!(sanitize_segment("a<b>c:d\"e"), "a_b_c_d_e");
    }

    #[test]
    fn sanitize_collapses_whitespace() {
        assert_eq!(sanitize_segment("  too   many\tspaces  "), "too many spaces");
    }

    #[test]
    fn sanitize_empty_falls_back_to_unknown() {
        assert_eq!(sanitize_segment(""), "Unknown");
        assert_eq!(sanitize_segment("   "), "Unknown");
        assert_eq!(sanitize_segment("..."), "Unknown");
    }

    #[test]
    fn sanitize_truncates_at_word_boundary() {
        let long = "word ".repeat(40); // 200 chars
        let out = sanitize_segment(&long);
        assert!(out.chars().count() <= 100);
        assert!(!out.ends_with(' '));
        assert!(out.ends_with("word"));
    }

    #[test]
    fn single_disc_file_name() {
        let mut m = meta("Song", "Artist", "Album");
        m.track_number = 7;
        assert_eq!(track_file_name(&m, "mp3"), "07 - Song.mp3");
    }

    #[test]
    fn multi_disc_prefix_orders_lexically() {
        let mut m = meta("Song", "Artist", "Album");
        m.total_discs = 2;

        m.disc_number = 1;
        m.track_number = 12;
        let d1t12 = track_file_name(&m, "mp3");

        m.disc_number = 2;
        m.track_number = 1;
        let d2t01 = track_file_name(&m, "mp3");

        assert_eq!(d1t12, "D1T12 - Song.mp3");
        assert_eq!(d2t01, "D2T01 - Song.mp3");
        // Disc 1 track 12 sorts before disc 2 track 1
        assert!(d1t12 < d2t01);
    }

    #[test]
    fn canonical_path_uses_album_artist() {
        let mut m = meta("Song", "Artist", "Album");
        m.album_artist = Some("Compiler".to_string());
        let path = canonical_path(Path::new("/music"), &m, "mp3");
        assert_eq!(
            path,
            PathBuf::from("/music/Compiler/Album/01 - Song.mp3")
        );
    }

    #[test]
    fn canonical_path_is_deterministic() {
        let m = meta("Song: Part 2?", "AC/DC", "Album");
        let a = canonical_path(Path::new("/music"), &m, "mp3");
        let b = canonical_path(Path::new("/music"), &m, "mp3");
        assert_eq!(a, b);
        assert_eq!(a, PathBuf::from("/music/AC_DC/Album/01 - Song_ Part 2_.mp3"));
    }

    #[test]
    fn collision_suffix_is_stable_and_distinct() {
        let a1 = collision_suffix("Artist A", "Album");
        let a2 = collision_suffix("Artist A", "Album");
        let b = collision_suffix("Artist B", "Album");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(a1.len(), 8);
    }

    #[test]
    fn disambiguate_keeps_extension() {
        let path = Path::new("/music/A/B/01 - Song.mp3");
        let out = disambiguate(path, "A", "B");
        assert_eq!(out.extension().and_then(|e| e.to_str()), Some("mp3"));
        assert!(out
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("01 - Song ["));
        assert_eq!(out.parent(), path.parent());
        // Deterministic
        assert_eq!(out, disambiguate(path, "A", "B"));
        assert_ne!(out, disambiguate(path, "Other", "B"));
    }
}
