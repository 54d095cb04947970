// Prepend the ws:// scheme if the target has none
pub fn sanitize_ws_address(target: &str) -> String {
    let mut target = target.to_lowercase();
    if target.starts_with("https://") {
        target.replace_range(..8, "wss://");
    } else if target.starts_with("http://") {
        target.replace_range(..7, "ws://");
    } else if !target.starts_with("ws://") && !target.starts_with("wss://") {
        target.insert_str(0, "ws://");
    }

    if target.ends_with('/') {
        target.pop();
    }

    target
}

// Truncate a hex string for log lines, keeping both ends readable
pub fn shorten_hex(hex: &str) -> String {
    if hex.len() <= 16 {
        return hex.to_string();
    }
    format!("{}..{}", &hex[..10], &hex[hex.len() - 6..])
}
