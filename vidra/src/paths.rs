//! Output path layout and title sanitization.

use std::path::{Path, PathBuf};

/// Make a catalog title safe for filenames.
///
/// Removes `< > : " / \ | ? *`, collapses whitespace runs to a single `.`
/// and trims the ends.
pub fn sanitize_title(input: &str) -> String {
    const INVALID: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    let cleaned: String = input
        .chars()
        .filter(|c| !INVALID.contains(c) && *c >= ' ')
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(".")
}

/// `<base>/<Sanitized.Title>.<year>.mp4`
pub fn movie_output_path(base: &Path, title: &str, year: Option<u32>) -> PathBuf {
    let title = sanitize_title(title);
    let file_name = match year {
        Some(year) => format!("{title}.{year}.mp4"),
        None => format!("{title}.mp4"),
    };
    base.join(file_name)
}

/// `<base>/<Show>/Season <NN>/<Show>.S<NN>E<NN>[ - <Episode.Name>].mp4`
pub fn episode_output_path(
    base: &Path,
    show_title: &str,
    season: u32,
    episode: u32,
    episode_title: Option<&str>,
) -> PathBuf {
    let show = sanitize_title(show_title);
    let mut file_name = format!("{show}.S{season:02}E{episode:02}");
    if let Some(name) = episode_title {
        let name = sanitize_title(name);
        if !name.is_empty() {
            file_name.push_str(&format!(" - {name}"));
        }
    }
    file_name.push_str(".mp4");
    base.join(&show)
        .join(format!("Season {season:02}"))
        .join(file_name)
}
