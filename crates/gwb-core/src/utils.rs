use std::{
    fs,
    io::Write,
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::Result;

pub const USERNAME_PLACEHOLDER: &str = "{username}";

/// Fill a welcome template for one member.
pub fn render_template(template: &str, handle: &str) -> String {
    template.replace(USERNAME_PLACEHOLDER, handle)
}

/// Trim + lowercase, the form commands and auto-reply triggers are matched in.
pub fn normalize_text(text: &str) -> String {
    text.trim().to_lowercase()
}

pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}

/// Sleep for `total` unless `cancel` fires first.
///
/// Returns `false` when the wait was cut short by cancellation.
pub async fn sleep_or_cancel(cancel: &CancellationToken, total: Duration) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    if total.is_zero() {
        return true;
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(total) => !cancel.is_cancelled(),
    }
}

pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Write `content` to a sibling temp file, then rename it over `path`.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let tmp_name = format!(
        ".{}.tmp-{}",
        path.file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("state"),
        std::process::id(),
    );
    let tmp_path = parent.join(tmp_name);
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}
