//! Path helpers for SSH key locations.

use camino::{Utf8Path, Utf8PathBuf};

/// Expands a leading `~/` prefix to the user's home directory.
///
/// When `HOME` is not set the path is returned unchanged, leaving OpenSSH to
/// report the missing key file.
///
/// # Examples
///
/// ```
/// # use camino::Utf8Path;
/// # use multissh::session::expand_tilde;
/// let home = std::env::var("HOME").expect("HOME should be set");
/// assert_eq!(
///     expand_tilde(Utf8Path::new("~/.ssh/id_ed25519")),
///     format!("{home}/.ssh/id_ed25519")
/// );
/// assert_eq!(expand_tilde(Utf8Path::new("/etc/key")), "/etc/key");
/// ```
#[must_use]
pub fn expand_tilde(path: &Utf8Path) -> Utf8PathBuf {
    if let Some(rest) = path.as_str().strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return Utf8PathBuf::from(format!("{}/{rest}", home.to_string_lossy()));
    }
    path.to_path_buf()
}
