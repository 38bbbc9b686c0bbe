// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Small helpers shared across modules.

use rand::RngCore;

/// Mask a sensitive string (like API keys) for logging.
///
/// Shows only the first `visible_prefix` characters and replaces the rest with "...".
///
/// # Examples
///
/// ```
/// use modeldock::utils::mask_sensitive;
///
/// let api_key = "hf_abcdefghijklmnopqrstuvwxyz";
/// assert_eq!(mask_sensitive(api_key, 3), "hf_...");
/// ```
pub fn mask_sensitive(input: &str, visible_prefix: usize) -> String {
    if input.len() <= visible_prefix {
        return format!("{}...", input);
    }

    let prefix: String = input.chars().take(visible_prefix).collect();
    format!("{}...", prefix)
}

/// Generate a new task identifier: 128 random bits, lowercase hex.
pub fn generate_task_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Format a byte count for log lines.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
